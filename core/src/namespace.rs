//! Identifier grammars for the update namespace.
//!
//! Tracks, tags, updates and rollouts are URL path segments, so a value that
//! does not match its grammar is reported as a not-found condition rather
//! than a bad request. Validation runs once per request (in the server's path
//! extractor) and the typed values flow through the rest of the core.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top-level partition of the update namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
	Prod,
	Ci,
}

impl Track {
	pub const ALL: [Track; 2] = [Track::Prod, Track::Ci];

	pub fn as_str(&self) -> &'static str {
		match self {
			Track::Prod => "prod",
			Track::Ci => "ci",
		}
	}
}

impl fmt::Display for Track {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Track {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s {
			"prod" => Ok(Track::Prod),
			"ci" => Ok(Track::Ci),
			// An unknown track token is a routing miss. Answering 404 without
			// a message avoids hinting at which prefixes exist.
			_ => Err(Error::NotFound(String::new())),
		}
	}
}

pub const TAG_PATTERN: &str = r"^[a-zA-Z0-9_\-\.\+]+$";
pub const NAME_PATTERN: &str = r"^[a-zA-Z0-9_\-\.]+$";

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(TAG_PATTERN).expect("invalid tag pattern"));
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(NAME_PATTERN).expect("invalid name pattern"));

macro_rules! name_type {
	($name:ident, $re:ident, $pattern:ident, $what:literal) => {
		#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			pub fn parse(value: impl Into<String>) -> Result<Self, Error> {
				let value = value.into();
				if $re.is_match(&value) {
					Ok(Self(value))
				} else {
					Err(Error::NotFound(format!(
						concat!($what, " must match a given regexp: {}"),
						$pattern
					)))
				}
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl TryFrom<String> for $name {
			type Error = Error;

			fn try_from(value: String) -> Result<Self, Error> {
				Self::parse(value)
			}
		}

		impl From<$name> for String {
			fn from(value: $name) -> String {
				value.0
			}
		}
	};
}

name_type!(TagName, TAG_RE, TAG_PATTERN, "Tag");
name_type!(UpdateName, NAME_RE, NAME_PATTERN, "Update name");
name_type!(RolloutName, NAME_RE, NAME_PATTERN, "Rollout name");

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn track_accepts_only_known_literals() {
		assert_eq!("prod".parse::<Track>().unwrap(), Track::Prod);
		assert_eq!("ci".parse::<Track>().unwrap(), Track::Ci);
		for bad in ["production", "CI", "dev", ""] {
			assert!(bad.parse::<Track>().unwrap_err().is_not_found());
		}
	}

	#[test]
	fn tag_grammar_allows_plus() {
		assert!(TagName::parse("lmp-v23.1+build").is_ok());
		assert!(UpdateName::parse("lmp-v23.1+build").is_err());
	}

	#[test]
	fn names_reject_path_tricks() {
		for bad in ["", "a/b", "..%2f", "a b", "журнал"] {
			assert!(TagName::parse(bad).is_err(), "{bad:?}");
			assert!(UpdateName::parse(bad).is_err(), "{bad:?}");
			assert!(RolloutName::parse(bad).is_err(), "{bad:?}");
		}
		assert!(UpdateName::parse("v23").is_ok());
		assert!(RolloutName::parse("wave_1.0").is_ok());
	}

	#[test]
	fn mismatch_message_names_the_pattern() {
		let err = RolloutName::parse("no/slashes").unwrap_err();
		assert!(err.is_not_found());
		assert!(err.to_string().contains(NAME_PATTERN));
	}
}
