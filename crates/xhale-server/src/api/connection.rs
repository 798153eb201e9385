//! Connect and disconnect endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;
use xhale_core::SessionId;

use crate::api::error::{ApiError, ApiResult};
use crate::api::session::CommandResponse;
use crate::state::SharedState;

/// Routes mounted under `/api`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
}

/// Request body for connecting to a sensor.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "session_id": "F1:22:09:3A:5B:C0" }))]
pub struct ConnectRequest {
    /// Session id from the discovered device list.
    #[schema(min_length = 1)]
    pub session_id: String,
}

/// Connect to a discovered sensor.
#[utoipa::path(
    post,
    path = "/api/connect",
    tag = "connection",
    operation_id = "connect",
    summary = "Connect to a discovered sensor",
    description = "Starts a connection attempt. The request returns once the \
        attempt is accepted; watch `/api/session` for `connected` or a return \
        to `disconnected` on failure. Failed attempts are not retried.",
    request_body = ConnectRequest,
    responses(
        (status = 202, description = "Connection attempt started", body = CommandResponse),
        (status = 400, description = "Empty session id", body = crate::api::ErrorResponse),
        (status = 404, description = "Device not discovered", body = crate::api::ErrorResponse),
        (status = 409, description = "Another connection owns the session", body = crate::api::ErrorResponse)
    )
)]
pub async fn connect(
    State(state): State<SharedState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    let session_id = request.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_session_id",
            "session_id must not be empty",
        ));
    }
    info!(session_id, "Connect requested");
    state.session().connect(SessionId::from(session_id)).await?;
    Ok(CommandResponse::accepted(&state))
}

/// Disconnect the current sensor.
#[utoipa::path(
    post,
    path = "/api/disconnect",
    tag = "connection",
    operation_id = "disconnect",
    summary = "Disconnect the current sensor",
    responses(
        (status = 202, description = "Disconnect started", body = CommandResponse),
        (status = 409, description = "Nothing is connected", body = crate::api::ErrorResponse)
    )
)]
pub async fn disconnect(
    State(state): State<SharedState>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    state.session().disconnect().await?;
    Ok(CommandResponse::accepted(&state))
}
