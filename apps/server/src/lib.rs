//! HTTP surface of the fleet update service.
//!
//! Route prefixes and handlers live here; everything of substance happens
//! in `fleetway-core`. Path segments are validated once by the extractors
//! in [`extract`] and flow into handlers as typed values.

use std::sync::Arc;

use axum::{
	routing::{get, post},
	Router,
};
use fleetway_core::Core;

pub mod error;
pub mod extract;
mod routes;

pub use error::ApiError;

pub fn router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/health", get(routes::health))
		.route("/updates/:track", get(routes::update_list_track))
		.route("/updates/:track/:tag", get(routes::update_list_tag))
		.route("/updates/:track/:tag/:update", post(routes::update_create))
		.route("/updates/:track/:tag/:update/tail", get(routes::update_tail))
		.route(
			"/updates/:track/:tag/:update/rollouts",
			get(routes::rollout_list),
		)
		.route(
			"/updates/:track/:tag/:update/rollouts/:rollout",
			get(routes::rollout_get).put(routes::rollout_put),
		)
		.route(
			"/updates/:track/:tag/:update/rollouts/:rollout/tail",
			get(routes::rollout_tail),
		)
		.route("/devices/:uuid", post(routes::device_register))
		.route("/devices/:uuid/events", post(routes::device_events))
		.with_state(core)
}
