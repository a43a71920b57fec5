//! Two-phase rollout commit.
//!
//! Phase 1 writes the resolved rollout document to file storage; that write
//! is the single source of truth and its success is what the caller gets
//! acknowledged. Phase 2 projects the effective device set into the device
//! directory from a spawned task, after the caller already has its answer.
//! A phase 2 failure is logged and left for the reconciler to repair; it is
//! never surfaced and never rolls back phase 1.

use tracing::{debug, error};

use crate::{
	directory::DeviceDirectory,
	error::{Error, Result},
	namespace::{RolloutName, TagName, Track, UpdateName},
	rollout::Rollout,
	storage::UpdateStore,
};

#[derive(Debug, Clone)]
pub struct CommitCoordinator {
	updates: UpdateStore,
	directory: DeviceDirectory,
}

impl CommitCoordinator {
	pub fn new(updates: UpdateStore, directory: DeviceDirectory) -> Self {
		Self { updates, directory }
	}

	/// Validates, resolves and commits a rollout. Returns once phase 1 (the
	/// authoritative file write) has succeeded; the directory projection
	/// runs in the background.
	pub async fn create_rollout(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		name: &RolloutName,
		mut rollout: Rollout,
	) -> Result<Rollout> {
		rollout.validate_request()?;

		if !self.updates.update_exists(track, tag, update).await? {
			return Err(Error::NotFound(
				"Update with this name does not exist".into(),
			));
		}
		match self.updates.read_rollout(track, tag, update, name).await {
			Ok(_) => {
				return Err(Error::Conflict(
					"Rollout with this name already exists".into(),
				))
			}
			Err(e) if e.is_not_found() => {}
			Err(e) => return Err(e),
		}

		rollout.resolve_effect(track, &self.directory).await?;
		rollout.created_at = chrono::Utc::now().timestamp();

		// Phase 1: authoritative write. `write_rollout` uses create_new, so
		// a concurrent duplicate still comes back as a conflict.
		self.updates
			.write_rollout(track, tag, update, name, &serde_json::to_string(&rollout)?)
			.await?;
		debug!(track = %track, tag = %tag, update = %update, rollout = %name,
			devices = rollout.effect.len(), "rollout committed");

		// Phase 2: best-effort projection. The reconciler repairs any
		// divergence, so the caller still gets its acceptance.
		let directory = self.directory.clone();
		let (projected, tag, update, name) = (rollout.clone(), tag.clone(), update.clone(), name.clone());
		tokio::spawn(async move {
			if let Err(e) = project(&directory, &tag, &update, &projected).await {
				error!(rollout = %name, error = %e, "failed to update devices for rollout");
			}
		});

		Ok(rollout)
	}
}

/// Applies a rollout's effective device set to the directory. A pure
/// function of `effect`, safe to re-run.
pub(crate) async fn project(
	directory: &DeviceDirectory,
	tag: &TagName,
	update: &UpdateName,
	rollout: &Rollout,
) -> Result<()> {
	for uuid in &rollout.effect {
		directory
			.assign_update(uuid, tag.as_str(), update.as_str())
			.await?;
	}
	Ok(())
}
