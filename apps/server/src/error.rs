use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tracing::error;

/// HTTP projection of the core error taxonomy. Client and not-found errors
/// keep their message; anything internal is logged server-side and answered
/// with a generic body.
#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub message: String,
}

impl ApiError {
	pub fn bad_request(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			message: message.into(),
		}
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::NOT_FOUND,
			message: message.into(),
		}
	}
}

impl From<fleetway_core::Error> for ApiError {
	fn from(err: fleetway_core::Error) -> Self {
		use fleetway_core::Error;
		let status = match &err {
			Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
			Error::NotFound(_) => StatusCode::NOT_FOUND,
			Error::Conflict(_) => StatusCode::CONFLICT,
			Error::Io(_) | Error::Json(_) | Error::Db(_) => {
				error!(error = %err, "request failed");
				return Self {
					status: StatusCode::INTERNAL_SERVER_ERROR,
					message: "Internal server error".into(),
				};
			}
		};
		Self {
			status,
			message: err.to_string(),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(self.status, self.message).into_response()
	}
}
