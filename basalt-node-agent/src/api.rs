//! Version-check trigger endpoints.
//!
//! The platform's HTTP front-end mounts this router; everything else about
//! that front-end (auth, response envelopes, the remaining API) lives
//! there, not here. Both endpoints acknowledge as soon as the request is
//! enqueued - whether the check later succeeds is not their concern.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::version::{PeerNotification, VersionCheckHandle, PEER_NOTIFY_PATH};

/// External trigger: re-check locally and broadcast to every peer agent.
pub const VERSION_CHECK_PATH: &str = "/version-check";

#[derive(Clone)]
pub struct ApiState {
    pub version_checks: VersionCheckHandle,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route(VERSION_CHECK_PATH, post(request_version_check))
        .route(PEER_NOTIFY_PATH, post(peer_version_check))
        .with_state(state)
}

#[derive(Serialize)]
struct Ack {
    result: &'static str,
}

async fn request_version_check(State(state): State<ApiState>) -> Json<Ack> {
    state.version_checks.request_broadcast().await;
    Json(Ack { result: "done" })
}

async fn peer_version_check(
    State(state): State<ApiState>,
    Json(notification): Json<PeerNotification>,
) -> Json<Ack> {
    info!(
        "version re-check requested by peer {}",
        notification.host_name
    );
    state.version_checks.request_local().await;
    Json(Ack { result: "OK" })
}
