//! HTTP API routes and handlers.
//!
//! - `health` - Service health checks
//! - `session` - Snapshot, discovery, scanning and durations
//! - `connection` - Connect and disconnect
//! - `sampling` - Sampling windows, readings and averaged uploads
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod connection;
pub mod error;
pub mod health;
pub mod openapi;
pub mod sampling;
pub mod session;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// ```text
/// /health                 - Health check
/// /swagger-ui             - Interactive API docs
/// /api
/// ├── /session            - Published snapshot
/// ├── /devices            - Discovered sensors
/// ├── /durations          - Per-sensor usage totals
/// ├── /scan/{start,stop}  - Scanning
/// ├── /connect            - Connect to a sensor
/// ├── /disconnect         - Disconnect
/// ├── /sampling/{start,stop}
/// ├── /readings           - Window readings and averages
/// ├── /readings/average   - Averaged sample upload
/// └── /openapi.json       - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .merge(session::router())
                .merge(connection::router())
                .merge(sampling::router()),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use xhale_core::decoder::TEMPERATURE_CHARACTERISTIC;
    use xhale_core::{
        Config, ConnectionState, HardwareAddress, ManagerSettings, MemoryStore, MockDevice,
        MockTransport, SessionId, SessionManager,
    };

    use super::*;
    use crate::state::AppState;

    const ADDR: HardwareAddress = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]);

    fn server() -> (TestServer, AppState, Arc<MockTransport>) {
        let (transport, events) = MockTransport::new();
        transport.add_device(MockDevice::sensor("s1", ADDR));
        let config = Config::default();
        let settings = ManagerSettings {
            tick_interval: Duration::from_millis(20),
            ..ManagerSettings::from(&config)
        };
        let (handle, _task) = SessionManager::spawn(
            transport.clone(),
            events,
            Arc::new(MemoryStore::new()),
            settings,
        );
        let state = AppState::new(config, handle);
        let server = TestServer::new(create_router(state.clone())).unwrap();
        (server, state, transport)
    }

    async fn wait_until(state: &AppState, predicate: impl FnMut(&xhale_core::SessionSnapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(3), state.session().wait_for(predicate))
            .await
            .expect("timed out")
            .unwrap();
    }

    async fn connected() -> (TestServer, AppState, Arc<MockTransport>) {
        let (server, state, transport) = server();
        wait_until(&state, |s| s.adapter_powered).await;
        server.post("/api/scan/start").await.assert_status(StatusCode::ACCEPTED);
        wait_until(&state, |s| !s.discovered.is_empty()).await;
        server
            .post("/api/connect")
            .json(&json!({ "session_id": "s1" }))
            .await
            .assert_status(StatusCode::ACCEPTED);
        wait_until(&state, |s| s.state == ConnectionState::Connected).await;
        (server, state, transport)
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (server, state, _) = server();
        wait_until(&state, |s| s.adapter_powered).await;
        let body: Value = server.get("/health").await.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["adapter_powered"], true);
    }

    #[tokio::test]
    async fn test_connect_unknown_device_is_not_found() {
        let (server, _, _) = server();
        let response = server
            .post("/api/connect")
            .json(&json!({ "session_id": "missing" }))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["error"], "DEVICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_connect_empty_session_id_is_bad_request() {
        let (server, _, _) = server();
        server
            .post("/api/connect")
            .json(&json!({ "session_id": "  " }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_conflicts() {
        let (server, _, _) = server();
        server
            .post("/api/disconnect")
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_session_flow_over_http() {
        let (server, state, transport) = connected().await;

        let devices: Value = server.get("/api/session").await.json();
        assert_eq!(devices["state"], "connected");
        assert_eq!(devices["current_address"], "AA:BB:CC:00:11:22");

        transport.notify(&SessionId::from("s1"), TEMPERATURE_CHARACTERISTIC, &[0x2C, 0x01]);
        wait_until(&state, |s| s.temperature.len() == 1).await;
        let readings: Value = server.get("/api/readings").await.json();
        assert_eq!(readings["summary"]["temperature_mean"], 3.0);

        server
            .post("/api/disconnect")
            .await
            .assert_status(StatusCode::ACCEPTED);
        wait_until(&state, |s| s.state == ConnectionState::Disconnected).await;
        let durations: Value = server.get("/api/durations").await.json();
        assert_eq!(durations["durations"][0]["hardware_address"], "AA:BB:CC:00:11:22");
        assert_eq!(durations["durations"][0]["active"], false);
    }

    #[tokio::test]
    async fn test_sampling_duration_is_validated() {
        let (server, _, _) = server();
        server
            .post("/api/sampling/start")
            .json(&json!({ "duration_secs": 2 }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .post("/api/sampling/start")
            .json(&json!({ "duration_secs": 10 }))
            .await
            .assert_status(StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_average_upload_uses_window_means() {
        let (server, state, transport) = connected().await;
        let id = SessionId::from("s1");
        transport.notify(&id, TEMPERATURE_CHARACTERISTIC, &[0xE8, 0x03]);
        transport.notify(&id, xhale_core::decoder::CARBON_MONOXIDE_CHARACTERISTIC, &[0x00, 0x0A]);
        wait_until(&state, |s| s.carbon_monoxide.len() == 1 && s.temperature.len() == 1).await;

        let response = server.post("/api/readings/average").json(&json!({})).await;
        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["hardware_address"], "AA:BB:CC:00:11:22");
        assert_eq!(body["temperature"], 10.0);
        assert_eq!(body["carbon_monoxide"], 10.0);
        assert!(body["key"].as_str().unwrap().starts_with("users/local/sensorData/"));
    }

    #[tokio::test]
    async fn test_average_upload_without_readings_is_rejected() {
        let (server, _, _) = server();
        server
            .post("/api/readings/average")
            .json(&json!({ "hardware_address": "01:02:03:04:05:06" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
