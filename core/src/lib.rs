//! Fleet update distribution core.
//!
//! Operators define updates inside tag namespaces, partitioned into `prod`
//! and `ci` tracks, and commit rollouts that target a subset of the device
//! fleet. Devices report raw telemetry which is folded into per-update
//! status journals; observers follow those journals through a resumable
//! tail stream. Rollout files on disk are the source of truth; the device
//! directory is a derived projection kept honest by the reconciler.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

pub mod commit;
pub mod directory;
pub mod error;
pub mod events;
pub mod namespace;
pub mod reconcile;
pub mod rollout;
pub mod storage;
pub mod tail;

pub use commit::CommitCoordinator;
pub use directory::DeviceDirectory;
pub use error::{Error, Result};
pub use events::{DeviceUpdateEvent, EventFolder, StatusRecord};
pub use namespace::{RolloutName, TagName, Track, UpdateName};
pub use reconcile::Reconciler;
pub use rollout::Rollout;
pub use storage::{DeviceFiles, UpdateStore};
pub use tail::{TailFrame, TailOptions};

#[derive(Debug, Clone)]
pub struct CoreConfig {
	pub data_dir: PathBuf,
	/// Retention cap for per-device raw event files.
	pub max_event_files: usize,
	/// Idle interval after which a tail connection gets a keep-alive frame.
	pub keepalive: Duration,
	/// How often a tail reader re-polls the journal for growth.
	pub poll_interval: Duration,
	/// Cadence of the directory reconciliation pass.
	pub reconcile_interval: Duration,
}

impl CoreConfig {
	pub fn new(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			data_dir: data_dir.into(),
			max_event_files: 20,
			keepalive: Duration::from_secs(30),
			poll_interval: Duration::from_millis(500),
			reconcile_interval: Duration::from_secs(300),
		}
	}
}

/// Wiring of the core components over one data directory.
pub struct Core {
	pub config: CoreConfig,
	pub updates: UpdateStore,
	pub devices: DeviceFiles,
	pub directory: DeviceDirectory,
	pub commits: CommitCoordinator,
	pub folder: EventFolder,
}

impl Core {
	pub async fn new(config: CoreConfig) -> Result<Arc<Self>> {
		let updates = UpdateStore::new(config.data_dir.join("updates"))?;
		let devices = DeviceFiles::new(config.data_dir.join("devices"))?;
		let directory = DeviceDirectory::open(&config.data_dir.join("directory.db")).await?;
		let commits = CommitCoordinator::new(updates.clone(), directory.clone());
		let folder = EventFolder::new(
			devices.clone(),
			updates.clone(),
			directory.clone(),
			config.max_event_files,
		);
		Ok(Arc::new(Self {
			config,
			updates,
			devices,
			directory,
			commits,
			folder,
		}))
	}

	/// Starts the periodic projection repair task.
	pub fn spawn_reconciler(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
		Reconciler::new(self.updates.clone(), self.directory.clone())
			.spawn(self.config.reconcile_interval, shutdown)
	}

	fn tail_options(&self, last_event_id: u64) -> TailOptions {
		TailOptions {
			last_event_id,
			keepalive: self.config.keepalive,
			poll_interval: self.config.poll_interval,
		}
	}

	/// Tail of a whole update's journal.
	pub fn tail_update(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		last_event_id: u64,
	) -> impl futures::Stream<Item = TailFrame> {
		tail::tail_journal(
			&self.updates,
			track,
			tag,
			update,
			None,
			self.tail_options(last_event_id),
		)
	}

	/// Tail narrowed to one rollout: only journal lines of devices in the
	/// rollout's frozen effect set are delivered. Fails up front when the
	/// rollout does not exist, so the caller can answer 404 instead of
	/// opening a stream.
	pub async fn tail_rollout(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		rollout: &RolloutName,
		last_event_id: u64,
	) -> Result<impl futures::Stream<Item = TailFrame>> {
		let doc: Rollout =
			serde_json::from_str(&self.updates.read_rollout(track, tag, update, rollout).await?)?;
		Ok(tail::tail_journal(
			&self.updates,
			track,
			tag,
			update,
			Some(doc.effect.into_iter().collect()),
			self.tail_options(last_event_id),
		))
	}
}
