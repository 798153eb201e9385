//! Sampling window and reading endpoints.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use xhale_core::{
    HardwareAddress, SampleSummary, SensorReading, MAX_SAMPLE_SECS, MIN_SAMPLE_SECS,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::session::CommandResponse;
use crate::state::SharedState;

/// Routes mounted under `/api`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sampling/start", post(start_sampling))
        .route("/sampling/stop", post(stop_sampling))
        .route("/readings", get(get_readings))
        .route("/readings/average", post(upload_average))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for opening a sampling window.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({ "duration_secs": 15 }))]
pub struct StartSamplingRequest {
    /// Window length. Defaults to the configured length.
    #[schema(minimum = 5, maximum = 60)]
    pub duration_secs: Option<u64>,

    /// Keep the window open until it is stopped explicitly.
    #[serde(default)]
    pub untimed: bool,
}

/// Readings of the current (or last) sampling window.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReadingsResponse {
    /// Whether the window is open.
    pub sampling_active: bool,

    /// When an open timed window closes.
    pub sampling_ends_at: Option<DateTime<Utc>>,

    /// Temperature readings in arrival order.
    pub temperature: Vec<SensorReading>,

    /// Carbon monoxide readings in arrival order.
    pub carbon_monoxide: Vec<SensorReading>,

    /// Averages over the window.
    pub summary: SampleSummary,
}

/// Request body for uploading an averaged sample. Omitted values are taken
/// from the current session and sampling window.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "hardware_address": "01:02:03:04:05:06",
    "temperature": 34.2,
    "carbon_monoxide": 12.0
}))]
pub struct AverageReadingRequest {
    /// Sensor the sample came from.
    pub hardware_address: Option<String>,

    /// Mean temperature in °C.
    pub temperature: Option<f64>,

    /// Mean carbon monoxide value.
    pub carbon_monoxide: Option<f64>,
}

/// Stored averaged sample.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "key": "users/local/sensorData/7c1e0f0e-8a43-4b59-9c1e-2f6f0a3c7d11",
    "hardware_address": "01:02:03:04:05:06",
    "temperature": 34.2,
    "carbon_monoxide": 12.0
}))]
pub struct AverageReadingResponse {
    /// Document key of the stored sample.
    pub key: String,

    /// Sensor the sample came from.
    pub hardware_address: String,

    /// Stored temperature.
    pub temperature: f64,

    /// Stored carbon monoxide value.
    pub carbon_monoxide: f64,
}

// ============================================================================
// Handlers
// ============================================================================

fn window_length(state: &SharedState, request: &StartSamplingRequest) -> ApiResult<Option<Duration>> {
    if request.untimed {
        return Ok(None);
    }
    let secs = request
        .duration_secs
        .unwrap_or(state.config().sampling.duration_secs);
    if !(MIN_SAMPLE_SECS..=MAX_SAMPLE_SECS).contains(&secs) {
        return Err(ApiError::bad_request(
            "invalid_duration",
            format!("duration_secs must be between {MIN_SAMPLE_SECS} and {MAX_SAMPLE_SECS}"),
        ));
    }
    Ok(Some(Duration::from_secs(secs)))
}

/// Open a sampling window.
#[utoipa::path(
    post,
    path = "/api/sampling/start",
    tag = "sampling",
    operation_id = "startSampling",
    summary = "Open a sampling window",
    description = "Clears the reading history and starts keeping readings. \
        A timed window closes itself; an untimed one stays open until \
        `/api/sampling/stop` or the end of the session.",
    request_body = StartSamplingRequest,
    responses(
        (status = 202, description = "Window opened", body = CommandResponse),
        (status = 400, description = "Duration out of range", body = crate::api::ErrorResponse)
    )
)]
pub async fn start_sampling(
    State(state): State<SharedState>,
    request: Option<Json<StartSamplingRequest>>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let length = window_length(&state, &request)?;
    state.session().start_sampling(length).await?;
    Ok(CommandResponse::accepted(&state))
}

/// Close the sampling window.
#[utoipa::path(
    post,
    path = "/api/sampling/stop",
    tag = "sampling",
    operation_id = "stopSampling",
    summary = "Close the sampling window",
    responses(
        (status = 202, description = "Window closed", body = CommandResponse)
    )
)]
pub async fn stop_sampling(
    State(state): State<SharedState>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    state.session().stop_sampling().await?;
    Ok(CommandResponse::accepted(&state))
}

/// Readings of the current window.
#[utoipa::path(
    get,
    path = "/api/readings",
    tag = "sampling",
    operation_id = "getReadings",
    summary = "Get window readings",
    responses(
        (status = 200, description = "Readings and averages", body = ReadingsResponse)
    )
)]
pub async fn get_readings(State(state): State<SharedState>) -> Json<ReadingsResponse> {
    let snapshot = state.session().snapshot();
    let summary = SampleSummary::from_readings(&snapshot.temperature, &snapshot.carbon_monoxide);
    Json(ReadingsResponse {
        sampling_active: snapshot.sampling_active,
        sampling_ends_at: snapshot.sampling_ends_at,
        temperature: snapshot.temperature,
        carbon_monoxide: snapshot.carbon_monoxide,
        summary,
    })
}

/// Upload one averaged sample.
#[utoipa::path(
    post,
    path = "/api/readings/average",
    tag = "sampling",
    operation_id = "uploadAverageReading",
    summary = "Store an averaged sample",
    description = "Stores `{timestamp, temperature, co, hardwareAddress}` under \
        the account's sensor data collection. Omitted fields fall back to the \
        connected sensor and the means of the current window.",
    request_body = AverageReadingRequest,
    responses(
        (status = 201, description = "Sample stored", body = AverageReadingResponse),
        (status = 400, description = "Missing or invalid values", body = crate::api::ErrorResponse),
        (status = 424, description = "Store write failed", body = crate::api::ErrorResponse)
    )
)]
pub async fn upload_average(
    State(state): State<SharedState>,
    Json(request): Json<AverageReadingRequest>,
) -> ApiResult<(StatusCode, Json<AverageReadingResponse>)> {
    let snapshot = state.session().snapshot();
    let summary = SampleSummary::from_readings(&snapshot.temperature, &snapshot.carbon_monoxide);

    let hardware_address: HardwareAddress = match request.hardware_address {
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request(
                "invalid_hardware_address",
                format!("'{raw}' is not a hardware address"),
            )
        })?,
        None => snapshot.current_address.ok_or_else(|| {
            ApiError::bad_request(
                "hardware_address_unknown",
                "No connected sensor with a known hardware address",
            )
        })?,
    };
    let temperature = request
        .temperature
        .or(summary.temperature_mean)
        .ok_or_else(|| ApiError::bad_request("no_readings", "No temperature readings to average"))?;
    let carbon_monoxide = request
        .carbon_monoxide
        .or(summary.carbon_monoxide_mean)
        .ok_or_else(|| ApiError::bad_request("no_readings", "No CO readings to average"))?;

    let key = state
        .session()
        .upload_average_reading(hardware_address, temperature, carbon_monoxide)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AverageReadingResponse {
            key: key.to_string(),
            hardware_address: hardware_address.to_string(),
            temperature,
            carbon_monoxide,
        }),
    ))
}
