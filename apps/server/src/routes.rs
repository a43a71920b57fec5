use std::{collections::BTreeMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
	extract::{rejection::JsonRejection, State},
	response::{
		sse::{Event, Sse},
		IntoResponse, Response,
	},
	Json,
};
use fleetway_core::{Core, DeviceUpdateEvent, Rollout, TailFrame, Track};
use futures::{Stream, StreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::{
	error::ApiError,
	extract::{RolloutPath, TagPath, TrackPath, UpdatePath},
};

pub async fn health() -> &'static str {
	"OK"
}

pub async fn update_list_track(
	TrackPath(track): TrackPath,
	State(core): State<Arc<Core>>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, ApiError> {
	Ok(Json(core.updates.list_updates(track, None).await?))
}

pub async fn update_list_tag(
	TagPath { track, tag }: TagPath,
	State(core): State<Arc<Core>>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, ApiError> {
	Ok(Json(core.updates.list_updates(track, Some(&tag)).await?))
}

pub async fn update_create(
	UpdatePath { track, tag, update }: UpdatePath,
	State(core): State<Arc<Core>>,
) -> Result<StatusCode, ApiError> {
	core.updates.create_update(track, &tag, &update).await?;
	Ok(StatusCode::CREATED)
}

pub async fn rollout_list(
	UpdatePath { track, tag, update }: UpdatePath,
	State(core): State<Arc<Core>>,
) -> Result<Json<Vec<String>>, ApiError> {
	Ok(Json(core.updates.list_rollouts(track, &tag, &update).await?))
}

pub async fn rollout_get(
	RolloutPath {
		track,
		tag,
		update,
		rollout,
	}: RolloutPath,
	State(core): State<Arc<Core>>,
) -> Result<Json<Rollout>, ApiError> {
	let content = core
		.updates
		.read_rollout(track, &tag, &update, &rollout)
		.await?;
	let doc: Rollout = serde_json::from_str(&content).map_err(fleetway_core::Error::from)?;
	Ok(Json(doc))
}

pub async fn rollout_put(
	RolloutPath {
		track,
		tag,
		update,
		rollout,
	}: RolloutPath,
	State(core): State<Arc<Core>>,
	payload: Result<Json<Rollout>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
	let Json(body) = payload.map_err(|_| ApiError::bad_request("Bad JSON body"))?;
	core.commits
		.create_rollout(track, &tag, &update, &rollout, body)
		.await?;
	// Phase 1 is durable; the directory projection continues in the
	// background.
	Ok(StatusCode::ACCEPTED)
}

pub async fn update_tail(
	UpdatePath { track, tag, update }: UpdatePath,
	State(core): State<Arc<Core>>,
	headers: HeaderMap,
) -> Response {
	let last_event_id = parse_last_event_id(&headers);
	sse_response(core.tail_update(track, &tag, &update, last_event_id))
}

pub async fn rollout_tail(
	RolloutPath {
		track,
		tag,
		update,
		rollout,
	}: RolloutPath,
	State(core): State<Arc<Core>>,
	headers: HeaderMap,
) -> Result<Response, ApiError> {
	let last_event_id = parse_last_event_id(&headers);
	let stream = core
		.tail_rollout(track, &tag, &update, &rollout, last_event_id)
		.await?;
	Ok(sse_response(stream))
}

#[derive(Debug, Deserialize)]
pub struct DeviceRegistration {
	pub track: Track,
	#[serde(default)]
	pub group: String,
}

pub async fn device_register(
	axum::extract::Path(uuid): axum::extract::Path<String>,
	State(core): State<Arc<Core>>,
	payload: Result<Json<DeviceRegistration>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
	let Json(body) = payload.map_err(|_| ApiError::bad_request("Bad JSON body"))?;
	if core.directory.get_device(&uuid).await?.is_some() {
		return Err(fleetway_core::Error::Conflict(
			"Device with this uuid already exists".into(),
		)
		.into());
	}
	core.directory
		.create_device(&uuid, body.track, &body.group)
		.await?;
	Ok(StatusCode::CREATED)
}

pub async fn device_events(
	axum::extract::Path(uuid): axum::extract::Path<String>,
	State(core): State<Arc<Core>>,
	payload: Result<Json<Vec<DeviceUpdateEvent>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
	let Json(events) = payload.map_err(|_| ApiError::bad_request("Bad JSON body"))?;
	core.folder.process_check_in(&uuid, events).await?;
	Ok(StatusCode::NO_CONTENT)
}

/// Resumption cursor: the index of the last journal line the client saw.
/// Absent or unparsable values stream from the start.
fn parse_last_event_id(headers: &HeaderMap) -> u64 {
	let Some(value) = headers.get("last-event-id") else {
		return 0;
	};
	match value.to_str().ok().and_then(|v| v.parse().ok()) {
		Some(id) => id,
		None => {
			warn!(value = ?value, "invalid Last-Event-ID - ignoring");
			0
		}
	}
}

/// Adapts a tail frame stream onto the SSE wire:
/// `event: log\nid: <n>\ndata: <line>\n\n` per journal line, a `: idle`
/// comment as keep-alive, and a terminal `event: error` frame carrying the
/// resumption id and a retry hint.
fn sse_response(frames: impl Stream<Item = TailFrame> + Send + 'static) -> Response {
	let events = frames.map(|frame| {
		Ok::<_, Infallible>(match frame {
			TailFrame::Log { id, line } => {
				Event::default().event("log").id(id.to_string()).data(line)
			}
			TailFrame::Idle => Event::default().comment("idle"),
			TailFrame::Error { id, message } => Event::default()
				.event("error")
				.id(id.to_string())
				.retry(Duration::from_millis(1000))
				.data(message),
		})
	});
	let mut response = Sse::new(events).into_response();
	let headers = response.headers_mut();
	// Intermediaries must neither cache nor buffer the stream.
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
	headers.insert(
		HeaderName::from_static("x-accel-buffering"),
		HeaderValue::from_static("no"),
	);
	response
}
