//! Typed path extractors.
//!
//! Track, tag, update and rollout segments are checked here, once per
//! request, before any handler runs. A malformed segment answers 404 (these
//! are URL path components, not body fields) with the expected pattern in
//! the message; an unknown track answers a bare 404.

use axum::{
	async_trait,
	extract::{FromRequestParts, Path},
};
use fleetway_core::{RolloutName, TagName, Track, UpdateName};
use http::request::Parts;

use crate::error::ApiError;

pub struct TrackPath(pub Track);

pub struct TagPath {
	pub track: Track,
	pub tag: TagName,
}

pub struct UpdatePath {
	pub track: Track,
	pub tag: TagName,
	pub update: UpdateName,
}

pub struct RolloutPath {
	pub track: Track,
	pub tag: TagName,
	pub update: UpdateName,
	pub rollout: RolloutName,
}

fn reject() -> ApiError {
	ApiError::not_found("")
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TrackPath {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(track): Path<String> = Path::from_request_parts(parts, state)
			.await
			.map_err(|_| reject())?;
		Ok(Self(track.parse()?))
	}
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TagPath {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path((track, tag)): Path<(String, String)> = Path::from_request_parts(parts, state)
			.await
			.map_err(|_| reject())?;
		Ok(Self {
			track: track.parse()?,
			tag: TagName::parse(tag)?,
		})
	}
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UpdatePath {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path((track, tag, update)): Path<(String, String, String)> =
			Path::from_request_parts(parts, state)
				.await
				.map_err(|_| reject())?;
		Ok(Self {
			track: track.parse()?,
			tag: TagName::parse(tag)?,
			update: UpdateName::parse(update)?,
		})
	}
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RolloutPath {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path((track, tag, update, rollout)): Path<(String, String, String, String)> =
			Path::from_request_parts(parts, state)
				.await
				.map_err(|_| reject())?;
		Ok(Self {
			track: track.parse()?,
			tag: TagName::parse(tag)?,
			update: UpdateName::parse(update)?,
			rollout: RolloutName::parse(rollout)?,
		})
	}
}
