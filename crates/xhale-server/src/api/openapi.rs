//! OpenAPI specification generation for the xhale API.
//!
//! The document is served at `/api/openapi.json`, rendered by Swagger UI at
//! `/swagger-ui`, and written to disk by the `gen-openapi` binary.

use axum::Json;
use utoipa::OpenApi;
use xhale_core::{
    ConnectionState, DeviceDuration, DiscoveredDevice, SampleSummary, SensorKind, SensorReading,
    SessionSnapshot,
};

use super::connection::ConnectRequest;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::sampling::{
    AverageReadingRequest, AverageReadingResponse, ReadingsResponse, StartSamplingRequest,
};
use super::session::{CommandResponse, DevicesResponse, DurationsResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns the serializer error if the document cannot be rendered.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for xhale.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "xhale API",
        version = "0.1.0",
        description = r#"
# xhale API

Local host for XHale breath sensors.

## Overview

1. **Discovery**: scan for sensors advertising the Environmental Sensing service
2. **Connection**: connect to one sensor at a time; temperature and CO stream in
3. **Sampling**: readings are kept only while a sampling window is open
4. **Usage tracking**: connected time is accumulated per sensor hardware address
   and survives restarts and crashes

Commands return `202 Accepted` once the session manager has taken them. Poll
`/api/session` to observe the result.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local xhale server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "session", description = "Published session state"),
        (name = "devices", description = "Sensor discovery"),
        (name = "connection", description = "Connecting and disconnecting a sensor"),
        (name = "sampling", description = "Sampling windows, readings and averaged uploads"),
        (name = "durations", description = "Per-sensor usage durations")
    ),
    paths(
        super::health::health_check,
        super::session::get_session,
        super::session::get_devices,
        super::session::get_durations,
        super::session::start_scan,
        super::session::stop_scan,
        super::connection::connect,
        super::connection::disconnect,
        super::sampling::start_sampling,
        super::sampling::stop_sampling,
        super::sampling::get_readings,
        super::sampling::upload_average,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            CommandResponse,
            DevicesResponse,
            DurationsResponse,
            ConnectRequest,
            StartSamplingRequest,
            ReadingsResponse,
            AverageReadingRequest,
            AverageReadingResponse,
            SessionSnapshot,
            ConnectionState,
            DiscoveredDevice,
            DeviceDuration,
            SensorKind,
            SensorReading,
            SampleSummary,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "xhale API");
        assert!(spec.paths.paths.contains_key("/api/connect"));
        assert!(spec.paths.paths.contains_key("/api/readings/average"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"xhale API\""));
    }
}
