//! Background repair of the device directory projection.
//!
//! Rollout files are authoritative; the directory rows they project into
//! can lag or, after a failed phase 2, never converge on their own. The
//! reconciler periodically recomputes every device's correct assignment
//! from the rollout documents and overwrites diverging rows. Group
//! membership is not re-evaluated here: the effect set frozen at rollout
//! creation is what counts.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
	directory::DeviceDirectory,
	error::Result,
	namespace::{RolloutName, TagName, Track, UpdateName},
	rollout::Rollout,
	storage::UpdateStore,
};

#[derive(Debug, Clone)]
pub struct Reconciler {
	updates: UpdateStore,
	directory: DeviceDirectory,
}

/// One committed rollout, as found on disk during a scan.
#[derive(Debug)]
struct CommittedRollout {
	tag: String,
	update: String,
	name: String,
	created_at: i64,
	effect: Vec<String>,
}

impl Reconciler {
	pub fn new(updates: UpdateStore, directory: DeviceDirectory) -> Self {
		Self { updates, directory }
	}

	/// Runs one pass immediately, then repeats every `interval` until the
	/// shutdown token fires.
	pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => return,
					_ = ticker.tick() => {
						if let Err(e) = self.run_once().await {
							error!(error = %e, "reconciliation pass failed");
						}
					}
				}
			}
		})
	}

	/// Recomputes every device's assignment from the rollout files and
	/// corrects the directory where they disagree.
	pub async fn run_once(&self) -> Result<usize> {
		let mut corrected = 0;
		for track in Track::ALL {
			let devices = self.directory.list_devices(track).await?;
			if devices.is_empty() {
				continue;
			}
			let rollouts = self.scan_rollouts(track).await?;
			for device in devices {
				// The newest rollout targeting the device wins; creation
				// time first, then path for a deterministic tie-break.
				let winner = rollouts
					.iter()
					.filter(|r| r.effect.iter().any(|uuid| uuid == &device.uuid))
					.max_by_key(|r| (r.created_at, &r.tag, &r.update, &r.name));
				let Some(winner) = winner else { continue };
				if device.tag != winner.tag || device.update_name != winner.update {
					warn!(
						device = %device.uuid,
						tag = %winner.tag,
						update = %winner.update,
						rollout = %winner.name,
						"correcting diverged device assignment"
					);
					self.directory
						.assign_update(&device.uuid, &winner.tag, &winner.update)
						.await?;
					corrected += 1;
				}
			}
		}
		if corrected > 0 {
			info!(corrected, "reconciliation pass corrected device assignments");
		}
		Ok(corrected)
	}

	async fn scan_rollouts(&self, track: Track) -> Result<Vec<CommittedRollout>> {
		let mut rollouts = Vec::new();
		for (tag, updates) in self.updates.list_updates(track, None).await? {
			let Ok(tag_name) = TagName::parse(tag.clone()) else {
				continue;
			};
			for update in updates {
				let Ok(update_name) = UpdateName::parse(update.clone()) else {
					continue;
				};
				for name in self
					.updates
					.list_rollouts(track, &tag_name, &update_name)
					.await?
				{
					let Ok(rollout_name) = RolloutName::parse(name.clone()) else {
						continue;
					};
					let content = self
						.updates
						.read_rollout(track, &tag_name, &update_name, &rollout_name)
						.await?;
					match serde_json::from_str::<Rollout>(&content) {
						Ok(doc) => rollouts.push(CommittedRollout {
							tag: tag.clone(),
							update: update.clone(),
							name,
							created_at: doc.created_at,
							effect: doc.effect,
						}),
						Err(e) => {
							// A corrupt document must not stall repair of
							// every other device.
							error!(tag = %tag, update = %update, rollout = %name, error = %e,
								"skipping unreadable rollout document");
						}
					}
				}
			}
		}
		Ok(rollouts)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fixture {
		_dir: tempfile::TempDir,
		updates: UpdateStore,
		directory: DeviceDirectory,
		reconciler: Reconciler,
		tag: TagName,
	}

	async fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let updates = UpdateStore::new(dir.path().join("updates")).unwrap();
		let directory = DeviceDirectory::open(&dir.path().join("dir.db"))
			.await
			.unwrap();
		let reconciler = Reconciler::new(updates.clone(), directory.clone());
		Fixture {
			_dir: dir,
			updates,
			directory,
			reconciler,
			tag: TagName::parse("master").unwrap(),
		}
	}

	impl Fixture {
		async fn committed_rollout(
			&self,
			update: &str,
			name: &str,
			created_at: i64,
			effect: &[&str],
		) {
			let update = UpdateName::parse(update).unwrap();
			self.updates
				.create_update(Track::Ci, &self.tag, &update)
				.await
				.unwrap();
			let doc = Rollout {
				uuids: effect.iter().map(|s| s.to_string()).collect(),
				effect: effect.iter().map(|s| s.to_string()).collect(),
				created_at,
				..Default::default()
			};
			self.updates
				.write_rollout(
					Track::Ci,
					&self.tag,
					&update,
					&RolloutName::parse(name).unwrap(),
					&serde_json::to_string(&doc).unwrap(),
				)
				.await
				.unwrap();
		}
	}

	#[tokio::test]
	async fn corrects_diverged_assignments() {
		let fx = fixture().await;
		fx.directory.create_device("dev-1", Track::Ci, "").await.unwrap();
		fx.committed_rollout("v23", "wave1", 100, &["dev-1"]).await;

		// Phase 2 never ran for this rollout: the row still says nothing.
		let corrected = fx.reconciler.run_once().await.unwrap();
		assert_eq!(corrected, 1);
		let device = fx.directory.get_device("dev-1").await.unwrap().unwrap();
		assert_eq!(device.update_name, "v23");

		// A converged directory needs no further correction.
		assert_eq!(fx.reconciler.run_once().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn newest_rollout_wins_across_updates() {
		let fx = fixture().await;
		fx.directory.create_device("dev-1", Track::Ci, "").await.unwrap();
		fx.committed_rollout("v23", "wave1", 100, &["dev-1"]).await;
		fx.committed_rollout("v24", "wave1", 200, &["dev-1"]).await;

		fx.reconciler.run_once().await.unwrap();
		let device = fx.directory.get_device("dev-1").await.unwrap().unwrap();
		assert_eq!(device.update_name, "v24");
	}

	#[tokio::test]
	async fn untargeted_devices_are_left_alone() {
		let fx = fixture().await;
		fx.directory.create_device("dev-1", Track::Ci, "").await.unwrap();
		fx.directory.create_device("dev-2", Track::Ci, "").await.unwrap();
		fx.committed_rollout("v23", "wave1", 100, &["dev-1"]).await;

		fx.reconciler.run_once().await.unwrap();
		let device = fx.directory.get_device("dev-2").await.unwrap().unwrap();
		assert!(device.assignment().is_none());
	}
}
