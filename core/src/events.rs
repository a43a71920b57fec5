//! Folding of raw device telemetry into status records.
//!
//! A device check-in delivers a batch of raw events, each tagged with a
//! correlation id tying the multi-step install sequence together
//! (download-started .. installation-completed). The folder groups the batch
//! by consecutive correlation id and distills each group into one status
//! record, which is appended to the journal of the update the device is
//! currently assigned to. One check-in is one atomic journal publish, so
//! records become visible in exactly the order they were folded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
	directory::DeviceDirectory,
	error::{Error, Result},
	storage::{DeviceFiles, UpdateStore, EVENTS_PREFIX},
};

/// Raw update event as reported by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdateEvent {
	pub id: String,
	#[serde(rename = "deviceTime")]
	pub device_time: String,
	pub event: DeviceEvent,
	#[serde(rename = "eventType")]
	pub event_type: DeviceEventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
	#[serde(rename = "correlationId")]
	pub correlation_id: String,
	pub ecu: String,
	/// Present only on a terminal event of the sequence.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub success: Option<bool>,
	#[serde(rename = "targetName")]
	pub target_name: String,
	pub version: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub details: String,
}

/// Event step identifier, e.g. `EcuDownloadStarted`. Kept as a free string:
/// devices own this vocabulary and new steps must not break ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEventType {
	pub id: String,
	pub version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStatus {
	InProgress,
	Succeeded,
	Failed,
}

/// One folded install attempt: a single journal line per correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
	pub device: String,
	#[serde(rename = "correlationId")]
	pub correlation_id: String,
	pub ecu: String,
	#[serde(rename = "targetName")]
	pub target_name: String,
	pub version: String,
	pub status: InstallStatus,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub details: String,
	#[serde(rename = "deviceTime")]
	pub device_time: String,
	#[serde(rename = "eventType")]
	pub event_type: String,
}

/// Mtime gap inserted between event files of different correlation ids.
/// Retention pruning orders by modification time, and filesystem clocks are
/// coarse; 4 ms is enough for mtimes to come out distinct.
const BATCH_MTIME_GAP: Duration = Duration::from_millis(4);

#[derive(Debug, Clone)]
pub struct EventFolder {
	devices: DeviceFiles,
	updates: UpdateStore,
	directory: DeviceDirectory,
	max_event_files: usize,
}

impl EventFolder {
	pub fn new(
		devices: DeviceFiles,
		updates: UpdateStore,
		directory: DeviceDirectory,
		max_event_files: usize,
	) -> Self {
		Self {
			devices,
			updates,
			directory,
			max_event_files,
		}
	}

	/// Processes one check-in batch: stores the raw events per correlation
	/// id, prunes retention, then folds each group into a status record and
	/// publishes them to the assigned update's journal in one rollover.
	pub async fn process_check_in(
		&self,
		uuid: &str,
		events: Vec<DeviceUpdateEvent>,
	) -> Result<()> {
		let device = self
			.directory
			.get_device(uuid)
			.await?
			.ok_or_else(|| Error::NotFound(format!("unknown device {uuid}")))?;
		self.directory.touch(uuid).await?;

		let mut records = Vec::new();
		for (i, group) in group_by_correlation(&events).into_iter().enumerate() {
			if i > 0 {
				tokio::time::sleep(BATCH_MTIME_GAP).await;
			}
			let corr_id = &group[0].event.correlation_id;
			let mut content = String::new();
			for event in group {
				content.push_str(&serde_json::to_string(event)?);
				content.push('\n');
			}
			self.devices
				.append_file(uuid, &format!("{EVENTS_PREFIX}{corr_id}"), &content)
				.await?;
			records.push(fold_group(uuid, group));
		}
		self.devices
			.rollover_files(uuid, EVENTS_PREFIX, self.max_event_files)
			.await?;

		// A device with no assignment yet has no journal to report into.
		let Some((track, tag, update)) = device.assignment() else {
			return Ok(());
		};
		if records.is_empty() {
			return Ok(());
		}
		for record in &records {
			self.updates
				.append_journal(track, &tag, &update, &serde_json::to_string(record)?)
				.await?;
		}
		self.updates.rollover_journal(track, &tag, &update).await
	}
}

/// Splits a batch into runs of consecutive events sharing a correlation id.
/// Devices are expected, but not required, to send one correlation id
/// contiguously; an interleaved batch simply produces more groups.
fn group_by_correlation(events: &[DeviceUpdateEvent]) -> Vec<&[DeviceUpdateEvent]> {
	let mut groups = Vec::new();
	let mut start = 0;
	for i in 1..events.len() {
		if events[i].event.correlation_id != events[start].event.correlation_id {
			groups.push(&events[start..i]);
			start = i;
		}
	}
	if start < events.len() {
		groups.push(&events[start..]);
	}
	groups
}

/// Distills one correlation group into a status record: the terminal success
/// flag if any event carries one (absence means in progress), the latest
/// non-empty details, and the last event's step for rendering progress.
fn fold_group(device: &str, group: &[DeviceUpdateEvent]) -> StatusRecord {
	let last = &group[group.len() - 1];
	let status = match group.iter().find_map(|e| e.event.success) {
		None => InstallStatus::InProgress,
		Some(true) => InstallStatus::Succeeded,
		Some(false) => InstallStatus::Failed,
	};
	let details = group
		.iter()
		.rev()
		.find(|e| !e.event.details.is_empty())
		.map(|e| e.event.details.clone())
		.unwrap_or_default();
	StatusRecord {
		device: device.to_owned(),
		correlation_id: last.event.correlation_id.clone(),
		ecu: last.event.ecu.clone(),
		target_name: last.event.target_name.clone(),
		version: last.event.version.clone(),
		status,
		details,
		device_time: last.device_time.clone(),
		event_type: last.event_type.id.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::namespace::{TagName, Track, UpdateName};

	pub(crate) fn event(
		corr_id: &str,
		step: &str,
		success: Option<bool>,
		details: &str,
	) -> DeviceUpdateEvent {
		DeviceUpdateEvent {
			id: format!("{step}_{corr_id}"),
			device_time: "2023-12-12T12:00:00".into(),
			event: DeviceEvent {
				correlation_id: corr_id.into(),
				ecu: "main".into(),
				success,
				target_name: "intel-corei7-64-lmp-23".into(),
				version: "23".into(),
				details: details.into(),
			},
			event_type: DeviceEventType {
				id: step.into(),
				version: 0,
			},
		}
	}

	fn install_sequence(corr_id: &str, success: bool) -> Vec<DeviceUpdateEvent> {
		vec![
			event(corr_id, "EcuDownloadStarted", None, ""),
			event(corr_id, "EcuDownloadCompleted", None, ""),
			event(corr_id, "EcuInstallationStarted", None, ""),
			event(corr_id, "EcuInstallationApplied", None, "rebooting"),
			event(corr_id, "EcuInstallationCompleted", Some(success), ""),
		]
	}

	#[test]
	fn full_sequence_folds_to_one_terminal_record() {
		let events = install_sequence("c1", true);
		let groups = group_by_correlation(&events);
		assert_eq!(groups.len(), 1);

		let record = fold_group("dev-1", groups[0]);
		assert_eq!(record.status, InstallStatus::Succeeded);
		assert_eq!(record.correlation_id, "c1");
		assert_eq!(record.device, "dev-1");
		assert_eq!(record.event_type, "EcuInstallationCompleted");
		// Latest non-empty details survive the fold.
		assert_eq!(record.details, "rebooting");
	}

	#[test]
	fn missing_success_flag_means_in_progress() {
		let events = vec![
			event("c1", "EcuDownloadStarted", None, ""),
			event("c1", "EcuDownloadCompleted", None, ""),
		];
		let record = fold_group("dev-1", &events);
		assert_eq!(record.status, InstallStatus::InProgress);
	}

	#[test]
	fn groups_split_on_correlation_change() {
		let mut events = install_sequence("c1", true);
		events.extend(install_sequence("c2", false));
		events.push(event("c1", "EcuDownloadStarted", None, "retry"));

		let groups = group_by_correlation(&events);
		assert_eq!(groups.len(), 3);
		assert_eq!(groups[0].len(), 5);
		assert_eq!(groups[1].len(), 5);
		assert_eq!(groups[2].len(), 1);

		assert_eq!(fold_group("d", groups[1]).status, InstallStatus::Failed);
		assert_eq!(fold_group("d", groups[2]).status, InstallStatus::InProgress);
	}

	#[tokio::test]
	async fn check_in_publishes_folded_records_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let updates = UpdateStore::new(dir.path().join("updates")).unwrap();
		let devices = DeviceFiles::new(dir.path().join("devices")).unwrap();
		let directory = crate::directory::DeviceDirectory::open(&dir.path().join("dir.db"))
			.await
			.unwrap();
		let folder = EventFolder::new(devices.clone(), updates.clone(), directory.clone(), 20);

		let tag = TagName::parse("master").unwrap();
		let update = UpdateName::parse("v23").unwrap();
		updates.create_update(Track::Ci, &tag, &update).await.unwrap();
		directory.create_device("dev-1", Track::Ci, "").await.unwrap();
		directory.assign_update("dev-1", "master", "v23").await.unwrap();

		let mut batch = install_sequence("c1", true);
		batch.extend(install_sequence("c2", false));
		folder.process_check_in("dev-1", batch).await.unwrap();

		let lines = updates.read_journal(Track::Ci, &tag, &update).await.unwrap();
		assert_eq!(lines.len(), 2);
		let first: StatusRecord = serde_json::from_str(&lines[0]).unwrap();
		let second: StatusRecord = serde_json::from_str(&lines[1]).unwrap();
		assert_eq!(first.correlation_id, "c1");
		assert_eq!(first.status, InstallStatus::Succeeded);
		assert_eq!(second.correlation_id, "c2");
		assert_eq!(second.status, InstallStatus::Failed);

		// Raw events were kept per correlation id for audit.
		let raw = devices.read_file("dev-1", "events-c1").await.unwrap();
		assert_eq!(raw.lines().count(), 5);

		// A later check-in lands after the earlier records.
		folder
			.process_check_in("dev-1", install_sequence("c3", true))
			.await
			.unwrap();
		let lines = updates.read_journal(Track::Ci, &tag, &update).await.unwrap();
		assert_eq!(lines.len(), 3);
		let third: StatusRecord = serde_json::from_str(&lines[2]).unwrap();
		assert_eq!(third.correlation_id, "c3");
	}

	#[tokio::test]
	async fn check_in_for_unknown_device_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let updates = UpdateStore::new(dir.path().join("updates")).unwrap();
		let devices = DeviceFiles::new(dir.path().join("devices")).unwrap();
		let directory = crate::directory::DeviceDirectory::open(&dir.path().join("dir.db"))
			.await
			.unwrap();
		let folder = EventFolder::new(devices, updates, directory, 20);

		let err = folder
			.process_check_in("ghost", vec![event("c1", "EcuDownloadStarted", None, "")])
			.await
			.unwrap_err();
		assert!(err.is_not_found());
	}
}
