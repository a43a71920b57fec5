//! Per-device raw file storage.
//!
//! Raw telemetry events land here for audit and debugging, one file per
//! correlation id. Retention is capped: after every appended batch the
//! oldest `events-*` files beyond the cap are pruned, ordered by file
//! modification time.

use std::{
	io::ErrorKind,
	path::PathBuf,
	time::SystemTime,
};

use tokio::{fs, io::AsyncWriteExt};

use crate::error::{Error, Result};

/// Shared name prefix of raw event files; the correlation id is the suffix.
pub const EVENTS_PREFIX: &str = "events-";

#[derive(Debug, Clone)]
pub struct DeviceFiles {
	root: PathBuf,
}

impl DeviceFiles {
	pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();
		std::fs::create_dir_all(&root)?;
		Ok(Self { root })
	}

	fn device_dir(&self, uuid: &str) -> PathBuf {
		self.root.join(uuid)
	}

	pub async fn append_file(&self, uuid: &str, name: &str, content: &str) -> Result<()> {
		let dir = self.device_dir(uuid);
		fs::create_dir_all(&dir).await?;
		let mut file = fs::OpenOptions::new()
			.append(true)
			.create(true)
			.open(dir.join(name))
			.await?;
		file.write_all(content.as_bytes()).await?;
		file.flush().await?;
		Ok(())
	}

	pub async fn read_file(&self, uuid: &str, name: &str) -> Result<String> {
		match fs::read_to_string(self.device_dir(uuid).join(name)).await {
			Ok(content) => Ok(content),
			Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
				"no file {name} for device {uuid}"
			))),
			Err(e) => Err(e.into()),
		}
	}

	/// Names of the device's files sharing `prefix`, oldest first by
	/// modification time. A device without a directory has no files.
	pub async fn list_files(&self, uuid: &str, prefix: &str) -> Result<Vec<String>> {
		Ok(self
			.match_files(uuid, prefix)
			.await?
			.into_iter()
			.map(|(name, _)| name)
			.collect())
	}

	/// Prunes the oldest files matching `prefix` so that at most `max`
	/// remain. Events files get distinct modification times per correlation
	/// batch (see the event folder), so mtime order is batch order.
	pub async fn rollover_files(&self, uuid: &str, prefix: &str, max: usize) -> Result<()> {
		let files = self.match_files(uuid, prefix).await?;
		if files.len() <= max {
			return Ok(());
		}
		let dir = self.device_dir(uuid);
		for (name, _) in &files[..files.len() - max] {
			fs::remove_file(dir.join(name)).await?;
		}
		Ok(())
	}

	async fn match_files(&self, uuid: &str, prefix: &str) -> Result<Vec<(String, SystemTime)>> {
		let mut files = Vec::new();
		let mut entries = match fs::read_dir(self.device_dir(uuid)).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
			Err(e) => return Err(e.into()),
		};
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.starts_with(prefix) {
				files.push((name, entry.metadata().await?.modified()?));
			}
		}
		files.sort_by(|a, b| a.1.cmp(&b.1));
		Ok(files)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn rollover_keeps_newest_files() {
		let dir = tempfile::tempdir().unwrap();
		let files = DeviceFiles::new(dir.path()).unwrap();
		let uuid = "dev-1";

		for i in 0..5 {
			let name = format!("{EVENTS_PREFIX}corr-{i}");
			files.append_file(uuid, &name, "{}\n").await.unwrap();
			// Coarse filesystem clocks need a nudge to order mtimes.
			tokio::time::sleep(Duration::from_millis(4)).await;
		}
		files.append_file(uuid, "other", "kept\n").await.unwrap();

		files.rollover_files(uuid, EVENTS_PREFIX, 3).await.unwrap();

		let names = files.list_files(uuid, EVENTS_PREFIX).await.unwrap();
		assert_eq!(
			names,
			vec!["events-corr-2", "events-corr-3", "events-corr-4"]
		);
		// Files outside the prefix are untouched by the rollover.
		assert_eq!(files.read_file(uuid, "other").await.unwrap(), "kept\n");
	}

	#[tokio::test]
	async fn unknown_device_has_no_files() {
		let dir = tempfile::tempdir().unwrap();
		let files = DeviceFiles::new(dir.path()).unwrap();

		assert!(files.list_files("ghost", EVENTS_PREFIX).await.unwrap().is_empty());
		files.rollover_files("ghost", EVENTS_PREFIX, 3).await.unwrap();
		assert!(files.read_file("ghost", "x").await.unwrap_err().is_not_found());
	}
}
