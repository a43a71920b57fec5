//! Rollout documents and targeting resolution.

use serde::{Deserialize, Serialize};

use crate::{
	directory::DeviceDirectory,
	error::{Error, Result},
	namespace::Track,
};

/// A rollout targets a subset of the fleet at one update: explicit device
/// uuids, group labels, or both. `effect` is the server-computed resolved
/// device set; clients must leave it empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rollout {
	#[serde(default)]
	pub uuids: Vec<String>,
	#[serde(default)]
	pub groups: Vec<String>,
	#[serde(default)]
	pub effect: Vec<String>,
	/// Unix seconds, server-set at commit time. Orders rollouts for the
	/// reconciler's "most recent wins" rule.
	#[serde(rename = "createdAt", default)]
	pub created_at: i64,
}

impl Rollout {
	/// Checks the caller-supplied document before any storage access.
	pub fn validate_request(&self) -> Result<()> {
		if self.uuids.is_empty() && self.groups.is_empty() {
			return Err(Error::InvalidInput(
				"Either uuids or groups must be set".into(),
			));
		}
		if !self.effect.is_empty() {
			return Err(Error::InvalidInput("Effective uuids are readonly".into()));
		}
		Ok(())
	}

	/// Resolves the effective device set against a point-in-time snapshot of
	/// the device directory: explicit uuids plus every device on this track
	/// whose group label matches, de-duplicated.
	pub async fn resolve_effect(&mut self, track: Track, directory: &DeviceDirectory) -> Result<()> {
		let mut effect = self.uuids.clone();
		effect.extend(directory.uuids_in_groups(track, &self.groups).await?);
		effect.sort();
		effect.dedup();
		self.effect = effect;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_must_carry_targets() {
		let rollout = Rollout::default();
		assert!(matches!(
			rollout.validate_request(),
			Err(Error::InvalidInput(_))
		));

		let rollout = Rollout {
			uuids: vec!["dev-1".into()],
			..Default::default()
		};
		assert!(rollout.validate_request().is_ok());

		let rollout = Rollout {
			groups: vec!["canary".into()],
			..Default::default()
		};
		assert!(rollout.validate_request().is_ok());
	}

	#[test]
	fn effect_is_read_only_in_requests() {
		let rollout = Rollout {
			uuids: vec!["dev-1".into()],
			effect: vec!["dev-1".into()],
			..Default::default()
		};
		let err = rollout.validate_request().unwrap_err();
		assert!(err.to_string().contains("readonly"));
	}

	#[tokio::test]
	async fn effect_unions_uuids_and_groups() {
		let dir = tempfile::tempdir().unwrap();
		let directory = DeviceDirectory::open(&dir.path().join("dir.db"))
			.await
			.unwrap();
		directory.create_device("dev-1", Track::Ci, "").await.unwrap();
		directory.create_device("dev-2", Track::Ci, "canary").await.unwrap();
		directory.create_device("dev-3", Track::Prod, "canary").await.unwrap();

		let mut rollout = Rollout {
			// dev-2 appears both explicitly and via its group.
			uuids: vec!["dev-1".into(), "dev-2".into()],
			groups: vec!["canary".into()],
			..Default::default()
		};
		rollout.resolve_effect(Track::Ci, &directory).await.unwrap();
		// De-duplicated and track-scoped: dev-3 is on prod.
		assert_eq!(rollout.effect, vec!["dev-1", "dev-2"]);
	}
}
