//! Device directory: the query-optimized projection store.
//!
//! One row per device carries its group label and its currently assigned
//! (tag, update). Assignments here are a cache derived from the rollout
//! documents; the documents stay authoritative and the reconciler corrects
//! any divergence, so concurrent last-write-wins updates are acceptable.

use std::path::Path;

use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePoolOptions},
	SqlitePool,
};

use crate::{
	error::Result,
	namespace::{TagName, Track, UpdateName},
};

const SCHEMA: &str = "\
	CREATE TABLE IF NOT EXISTS devices (
		uuid TEXT PRIMARY KEY,
		track TEXT NOT NULL,
		device_group TEXT NOT NULL DEFAULT '',
		tag TEXT NOT NULL DEFAULT '',
		update_name TEXT NOT NULL DEFAULT '',
		last_seen INTEGER NOT NULL DEFAULT 0
	)";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DirectoryDevice {
	pub uuid: String,
	pub track: String,
	pub device_group: String,
	pub tag: String,
	pub update_name: String,
	pub last_seen: i64,
}

impl DirectoryDevice {
	/// The device's currently assigned update, if any.
	pub fn assignment(&self) -> Option<(Track, TagName, UpdateName)> {
		if self.tag.is_empty() || self.update_name.is_empty() {
			return None;
		}
		Some((
			self.track.parse().ok()?,
			TagName::parse(self.tag.clone()).ok()?,
			UpdateName::parse(self.update_name.clone()).ok()?,
		))
	}
}

#[derive(Debug, Clone)]
pub struct DeviceDirectory {
	pool: SqlitePool,
}

impl DeviceDirectory {
	pub async fn open(path: &Path) -> Result<Self> {
		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts)
			.await?;
		sqlx::query(SCHEMA).execute(&pool).await?;
		Ok(Self { pool })
	}

	pub async fn create_device(&self, uuid: &str, track: Track, group: &str) -> Result<()> {
		sqlx::query(
			"INSERT INTO devices (uuid, track, device_group, last_seen) VALUES (?1, ?2, ?3, ?4)",
		)
		.bind(uuid)
		.bind(track.as_str())
		.bind(group)
		.bind(chrono::Utc::now().timestamp())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn get_device(&self, uuid: &str) -> Result<Option<DirectoryDevice>> {
		Ok(sqlx::query_as::<_, DirectoryDevice>(
			"SELECT uuid, track, device_group, tag, update_name, last_seen \
			 FROM devices WHERE uuid = ?1",
		)
		.bind(uuid)
		.fetch_optional(&self.pool)
		.await?)
	}

	pub async fn touch(&self, uuid: &str) -> Result<()> {
		sqlx::query("UPDATE devices SET last_seen = ?2 WHERE uuid = ?1")
			.bind(uuid)
			.bind(chrono::Utc::now().timestamp())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Point-in-time snapshot of the devices on `track` whose group label is
	/// one of `groups`. This is what rollout effect resolution runs against.
	pub async fn uuids_in_groups(&self, track: Track, groups: &[String]) -> Result<Vec<String>> {
		if groups.is_empty() {
			return Ok(Vec::new());
		}
		let placeholders = (0..groups.len())
			.map(|i| format!("?{}", i + 2))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = format!(
			"SELECT uuid FROM devices WHERE track = ?1 AND device_group IN ({placeholders})"
		);
		let mut query = sqlx::query_scalar::<_, String>(&sql).bind(track.as_str());
		for group in groups {
			query = query.bind(group);
		}
		Ok(query.fetch_all(&self.pool).await?)
	}

	/// Projects a rollout assignment onto one device row. Idempotent, so a
	/// commit replay or a reconciliation pass can re-run it safely.
	pub async fn assign_update(&self, uuid: &str, tag: &str, update: &str) -> Result<()> {
		sqlx::query("UPDATE devices SET tag = ?2, update_name = ?3 WHERE uuid = ?1")
			.bind(uuid)
			.bind(tag)
			.bind(update)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn list_devices(&self, track: Track) -> Result<Vec<DirectoryDevice>> {
		Ok(sqlx::query_as::<_, DirectoryDevice>(
			"SELECT uuid, track, device_group, tag, update_name, last_seen \
			 FROM devices WHERE track = ?1 ORDER BY uuid",
		)
		.bind(track.as_str())
		.fetch_all(&self.pool)
		.await?)
	}
}
