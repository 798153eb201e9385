//! Session, discovery and duration endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use xhale_core::{ConnectionState, DeviceDuration, DiscoveredDevice, SessionSnapshot};

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Routes mounted under `/api`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/session", get(get_session))
        .route("/devices", get(get_devices))
        .route("/durations", get(get_durations))
        .route("/scan/start", post(start_scan))
        .route("/scan/stop", post(stop_scan))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Acknowledgement of an accepted command. The effect shows up in later
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "accepted": true,
    "state": "discovering"
}))]
pub struct CommandResponse {
    /// Always true; refusals are reported as errors.
    pub accepted: bool,

    /// Connection state when the command was accepted.
    pub state: ConnectionState,
}

impl CommandResponse {
    pub(crate) fn accepted(state: &SharedState) -> (StatusCode, Json<Self>) {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                accepted: true,
                state: state.session().snapshot().state,
            }),
        )
    }
}

/// Discovered sensors.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DevicesResponse {
    /// Sensors in discovery order.
    pub devices: Vec<DiscoveredDevice>,

    /// Whether a scan is running.
    pub is_scanning: bool,

    /// Whether the adapter is powered.
    pub adapter_powered: bool,
}

/// Per-sensor usage totals.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DurationsResponse {
    /// Totals for every sensor seen since startup.
    pub durations: Vec<DeviceDuration>,

    /// Whether the current session runs untracked.
    pub tracking_degraded: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Full published session snapshot.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    operation_id = "getSession",
    summary = "Get the session snapshot",
    description = "Returns everything the session manager publishes: connection \
        state, current device, readings of the sampling window, discovered \
        devices and live durations.",
    responses(
        (status = 200, description = "Current snapshot", body = SessionSnapshot)
    )
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    Json(state.session().snapshot())
}

/// Discovered device list.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "getDevices",
    summary = "List discovered sensors",
    responses(
        (status = 200, description = "Discovered sensors", body = DevicesResponse)
    )
)]
pub async fn get_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    let snapshot = state.session().snapshot();
    Json(DevicesResponse {
        devices: snapshot.discovered,
        is_scanning: snapshot.is_scanning,
        adapter_powered: snapshot.adapter_powered,
    })
}

/// Live per-sensor usage durations.
#[utoipa::path(
    get,
    path = "/api/durations",
    tag = "durations",
    operation_id = "getDurations",
    summary = "Get usage durations",
    description = "Cumulative connected time per sensor hardware address, \
        including the running session.",
    responses(
        (status = 200, description = "Durations", body = DurationsResponse)
    )
)]
pub async fn get_durations(State(state): State<SharedState>) -> Json<DurationsResponse> {
    let snapshot = state.session().snapshot();
    Json(DurationsResponse {
        durations: snapshot.durations,
        tracking_degraded: snapshot.tracking_degraded,
    })
}

/// Start scanning.
#[utoipa::path(
    post,
    path = "/api/scan/start",
    tag = "devices",
    operation_id = "startScan",
    summary = "Start scanning for sensors",
    responses(
        (status = 202, description = "Scan requested", body = CommandResponse),
        (status = 503, description = "Adapter powered off", body = crate::api::ErrorResponse)
    )
)]
pub async fn start_scan(
    State(state): State<SharedState>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    state.session().start_scanning().await?;
    Ok(CommandResponse::accepted(&state))
}

/// Stop scanning.
#[utoipa::path(
    post,
    path = "/api/scan/stop",
    tag = "devices",
    operation_id = "stopScan",
    summary = "Stop scanning",
    responses(
        (status = 202, description = "Scan stop requested", body = CommandResponse)
    )
)]
pub async fn stop_scan(
    State(state): State<SharedState>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    state.session().stop_scanning().await?;
    Ok(CommandResponse::accepted(&state))
}
