//! File-backed storage for updates, rollouts and status journals.
//!
//! Layout under the storage root:
//!
//! ```text
//! {track}/{tag}/{update}/rollouts/{rollout}   rollout document
//! {track}/{tag}/{update}/logs/journal         closed status journal
//! {track}/{tag}/{update}/logs/journal.partial in-progress journal
//! ```
//!
//! The journal is published by renaming the partial file onto the closed
//! file name. The rename is atomic within one filesystem, so readers only
//! ever observe complete lines and no locking is needed between the single
//! journal writer and any number of tailing readers.

use std::{
	collections::BTreeMap,
	io::ErrorKind,
	path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt};

use crate::{
	error::{Error, Result},
	namespace::{RolloutName, TagName, Track, UpdateName},
};

mod devices;

pub use devices::{DeviceFiles, EVENTS_PREFIX};

const ROLLOUTS_DIR: &str = "rollouts";
const LOGS_DIR: &str = "logs";
const JOURNAL_FILE: &str = "journal";
const PARTIAL_SUFFIX: &str = ".partial";

/// Store of update namespaces: rollout documents and per-update journals.
#[derive(Debug, Clone)]
pub struct UpdateStore {
	root: PathBuf,
}

impl UpdateStore {
	pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();
		std::fs::create_dir_all(&root)
			.map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("unable to initialize update storage at {}: {e}", root.display()))))?;
		Ok(Self { root })
	}

	fn update_dir(&self, track: Track, tag: &TagName, update: &UpdateName) -> PathBuf {
		self.root
			.join(track.as_str())
			.join(tag.as_str())
			.join(update.as_str())
	}

	fn rollout_path(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		rollout: &RolloutName,
	) -> PathBuf {
		self.update_dir(track, tag, update)
			.join(ROLLOUTS_DIR)
			.join(rollout.as_str())
	}

	pub fn journal_path(&self, track: Track, tag: &TagName, update: &UpdateName) -> PathBuf {
		self.update_dir(track, tag, update)
			.join(LOGS_DIR)
			.join(JOURNAL_FILE)
	}

	/// Registers an update namespace. Artifact contents are handled
	/// elsewhere; existence is what rollout creation checks against.
	pub async fn create_update(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
	) -> Result<()> {
		fs::create_dir_all(self.update_dir(track, tag, update).join(ROLLOUTS_DIR)).await?;
		Ok(())
	}

	pub async fn update_exists(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
	) -> Result<bool> {
		match fs::metadata(self.update_dir(track, tag, update)).await {
			Ok(meta) => Ok(meta.is_dir()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Lists update names per tag on one track. A missing tag (or a track
	/// with no uploads yet) yields an empty map, not an error.
	pub async fn list_updates(
		&self,
		track: Track,
		tag: Option<&TagName>,
	) -> Result<BTreeMap<String, Vec<String>>> {
		let track_dir = self.root.join(track.as_str());
		let tags = match tag {
			Some(tag) => vec![tag.as_str().to_owned()],
			None => list_dir_names(&track_dir).await?,
		};

		let mut res = BTreeMap::new();
		for tag in tags {
			let updates = list_dir_names(&track_dir.join(&tag)).await?;
			if !updates.is_empty() {
				res.insert(tag, updates);
			}
		}
		Ok(res)
	}

	pub async fn list_rollouts(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
	) -> Result<Vec<String>> {
		let dir = self.update_dir(track, tag, update).join(ROLLOUTS_DIR);
		let mut names = Vec::new();
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
			Err(e) => return Err(e.into()),
		};
		while let Some(entry) = entries.next_entry().await? {
			if entry.file_type().await?.is_file() {
				names.push(entry.file_name().to_string_lossy().into_owned());
			}
		}
		names.sort();
		Ok(names)
	}

	/// Writes a rollout document. Rollouts are write-once: an existing file
	/// with the same name is a conflict, detected race-free via `create_new`.
	pub async fn write_rollout(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		rollout: &RolloutName,
		content: &str,
	) -> Result<()> {
		let path = self.rollout_path(track, tag, update, rollout);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await?;
		}
		let mut file = match fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&path)
			.await
		{
			Ok(file) => file,
			Err(e) if e.kind() == ErrorKind::AlreadyExists => {
				return Err(Error::Conflict(format!(
					"Rollout {rollout} already exists"
				)))
			}
			Err(e) => return Err(e.into()),
		};
		file.write_all(content.as_bytes()).await?;
		file.flush().await?;
		Ok(())
	}

	pub async fn read_rollout(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		rollout: &RolloutName,
	) -> Result<String> {
		let path = self.rollout_path(track, tag, update, rollout);
		match fs::read_to_string(&path).await {
			Ok(content) => Ok(content),
			Err(e) if e.kind() == ErrorKind::NotFound => {
				Err(Error::NotFound(format!("Not found rollout {rollout}")))
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Appends one record line to the partial journal. Appended lines stay
	/// invisible to readers until the next [`Self::rollover_journal`].
	pub async fn append_journal(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
		line: &str,
	) -> Result<()> {
		let mut path = self.journal_path(track, tag, update);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await?;
		}
		path.set_file_name(format!("{JOURNAL_FILE}{PARTIAL_SUFFIX}"));
		let mut file = fs::OpenOptions::new()
			.append(true)
			.create(true)
			.open(&path)
			.await?;
		file.write_all(line.as_bytes()).await?;
		file.write_all(b"\n").await?;
		file.flush().await?;
		Ok(())
	}

	/// Publishes the partial journal by renaming it onto the closed file.
	/// No partial file means no new writes since the last rollover, which is
	/// fine and leaves the closed journal untouched.
	pub async fn rollover_journal(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
	) -> Result<()> {
		let to = self.journal_path(track, tag, update);
		let mut from = to.clone();
		from.set_file_name(format!("{JOURNAL_FILE}{PARTIAL_SUFFIX}"));
		match fs::rename(&from, &to).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Reads every line of the closed journal. A missing journal is a
	/// distinct "no data yet" condition; callers poll for growth themselves.
	pub async fn read_journal(
		&self,
		track: Track,
		tag: &TagName,
		update: &UpdateName,
	) -> Result<Vec<String>> {
		read_journal_file(&self.journal_path(track, tag, update)).await
	}
}

pub(crate) async fn read_journal_file(path: &Path) -> Result<Vec<String>> {
	match fs::read_to_string(path).await {
		Ok(content) => Ok(content.lines().map(str::to_owned).collect()),
		Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
			"no journal at {}",
			path.display()
		))),
		Err(e) => Err(e.into()),
	}
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
	let mut names = Vec::new();
	let mut entries = match fs::read_dir(dir).await {
		Ok(entries) => entries,
		Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
		Err(e) => return Err(e.into()),
	};
	while let Some(entry) = entries.next_entry().await? {
		if entry.file_type().await?.is_dir() {
			names.push(entry.file_name().to_string_lossy().into_owned());
		}
	}
	names.sort();
	Ok(names)
}
