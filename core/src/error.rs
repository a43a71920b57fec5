use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error taxonomy. The HTTP layer maps the first three variants to
/// 400/404/409; everything else is a 500 with the detail kept in server logs.
#[derive(Debug, Error)]
pub enum Error {
	#[error("{0}")]
	InvalidInput(String),
	#[error("{0}")]
	NotFound(String),
	#[error("{0}")]
	Conflict(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Db(#[from] sqlx::Error),
}

impl Error {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}
}
