//! Unified error type for the xhale core library.
//!
//! Each module reports its own error type ([`TransportError`],
//! [`StoreError`], [`ConfigError`], [`ManagerError`], [`DecodeError`]).
//! [`XhaleError`] folds them into one enum with HTTP status codes and
//! machine-readable error codes for the server.
//!
//! None of these errors is fatal: a failed operation leaves the session
//! manager running with reduced functionality.
//!
//! [`TransportError`]: crate::transport::TransportError
//! [`StoreError`]: crate::store::StoreError
//! [`ConfigError`]: crate::config::ConfigError
//! [`ManagerError`]: crate::manager::ManagerError
//! [`DecodeError`]: crate::decoder::DecodeError

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all xhale operations.
#[derive(Debug, Error)]
pub enum XhaleError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// No usable Bluetooth adapter.
    #[error(
        "Bluetooth adapter unavailable: {0}. Ensure bluetoothd is running and the adapter exists."
    )]
    AdapterUnavailable(String),

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Scanning could not be started or stopped.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    /// The link to a sensor could not be established or set up.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The session id is not a discovered sensor.
    #[error("Device not found: '{0}'. Start a scan and wait for the sensor to be discovered.")]
    DeviceNotFound(String),

    // =========================================================================
    // SESSION ERRORS
    // =========================================================================
    /// Another connection owns the session.
    #[error("Session busy: a sensor is already {0}")]
    SessionBusy(String),

    /// The operation needs a connected sensor.
    #[error("No sensor is connected")]
    NotConnected,

    /// The session manager has shut down.
    #[error("Session manager is not running")]
    ManagerStopped,

    /// A characteristic payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// The remote store rejected or failed an operation.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for xhale operations.
pub type Result<T> = std::result::Result<T, XhaleError>;

impl XhaleError {
    /// Returns `true` if this error comes from the Bluetooth transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable(_)
                | Self::AdapterPoweredOff
                | Self::ScanFailed(_)
                | Self::ConnectionFailed(_)
                | Self::DeviceNotFound(_)
        )
    }

    /// Returns `true` if this error concerns the connection session.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionBusy(_) | Self::NotConnected | Self::ManagerStopped | Self::Decode(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to persistence or I/O.
    #[inline]
    #[must_use]
    pub const fn is_persistence_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying later may succeed without user action.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed(_)
                | Self::ConnectionFailed(_)
                | Self::DeviceNotFound(_)
                | Self::SessionBusy(_)
                | Self::PersistenceError(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::Decode(_) => 400,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::DeviceNotFound(_) => 404,

            // 409 Conflict - session state does not allow the operation
            Self::SessionBusy(_) | Self::NotConnected => 409,

            // 422 Unprocessable Entity
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 424 Failed Dependency - the sensor or store let us down
            Self::ConnectionFailed(_) | Self::PersistenceError(_) => 424,

            // 500 Internal Server Error
            Self::IoError(_) => 500,

            // 503 Service Unavailable
            Self::AdapterUnavailable(_)
            | Self::AdapterPoweredOff
            | Self::ScanFailed(_)
            | Self::ManagerStopped => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AdapterUnavailable(_) => "BLUETOOTH_ADAPTER_UNAVAILABLE",
            Self::AdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::ScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::SessionBusy(_) => "SESSION_BUSY",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ManagerStopped => "MANAGER_STOPPED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for XhaleError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {path}: {source}"))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::transport::TransportError> for XhaleError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterUnavailable(message) => Self::AdapterUnavailable(message),
            TransportError::PoweredOff => Self::AdapterPoweredOff,
            TransportError::UnknownDevice(id) => Self::DeviceNotFound(id.to_string()),
            TransportError::ScanFailed(message) => Self::ScanFailed(message),
            e @ (TransportError::ConnectFailed { .. }
            | TransportError::DiscoveryFailed(_)
            | TransportError::SubscribeFailed { .. }
            | TransportError::ReadFailed { .. }
            | TransportError::DisconnectFailed(_)) => Self::ConnectionFailed(e.to_string()),
        }
    }
}

impl From<crate::store::StoreError> for XhaleError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::Io { source, .. } => Self::IoError(source),
            e => Self::PersistenceError(e.to_string()),
        }
    }
}

impl From<crate::manager::ManagerError> for XhaleError {
    fn from(err: crate::manager::ManagerError) -> Self {
        use crate::manager::ManagerError;
        match err {
            ManagerError::UnknownDevice(id) => Self::DeviceNotFound(id.to_string()),
            ManagerError::Busy(state) => Self::SessionBusy(
                serde_json::to_value(state)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("{state:?}")),
            ),
            ManagerError::NotConnected => Self::NotConnected,
            ManagerError::AdapterPoweredOff => Self::AdapterPoweredOff,
            ManagerError::Stopped => Self::ManagerStopped,
        }
    }
}

impl From<crate::decoder::DecodeError> for XhaleError {
    fn from(err: crate::decoder::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::manager::ManagerError;
    use crate::store::StoreError;
    use crate::transport::TransportError;
    use crate::types::{ConnectionState, SessionId};
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_transport_error_classification() {
        assert!(XhaleError::AdapterPoweredOff.is_transport_error());
        assert!(XhaleError::ScanFailed("busy".into()).is_transport_error());
        assert!(XhaleError::DeviceNotFound("a".into()).is_transport_error());
        assert!(!XhaleError::NotConnected.is_transport_error());
    }

    #[test]
    fn test_session_and_config_classification() {
        assert!(XhaleError::SessionBusy("connected".into()).is_session_error());
        assert!(XhaleError::ManagerStopped.is_session_error());
        assert!(XhaleError::ConfigNotFound(PathBuf::from("/x")).is_config_error());
        assert!(!XhaleError::AdapterPoweredOff.is_config_error());
    }

    #[test]
    fn test_persistence_classification() {
        assert!(XhaleError::PersistenceError("offline".into()).is_persistence_error());
        assert!(XhaleError::IoError(IoErr::new(ErrorKind::Other, "x")).is_persistence_error());
        assert!(!XhaleError::NotConnected.is_persistence_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(XhaleError::ConnectionFailed("timeout".into()).is_recoverable());
        assert!(XhaleError::PersistenceError("offline".into()).is_recoverable());
        assert!(!XhaleError::AdapterUnavailable("none".into()).is_recoverable());
        assert!(!XhaleError::ConfigValidationError("bad".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(XhaleError::Decode("short".into()).http_status_code(), 400);
        assert_eq!(XhaleError::DeviceNotFound("a".into()).http_status_code(), 404);
        assert_eq!(XhaleError::NotConnected.http_status_code(), 409);
        assert_eq!(
            XhaleError::ConfigValidationError("x".into()).http_status_code(),
            422
        );
        assert_eq!(
            XhaleError::PersistenceError("x".into()).http_status_code(),
            424
        );
        assert_eq!(XhaleError::AdapterPoweredOff.http_status_code(), 503);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(XhaleError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(
            XhaleError::AdapterPoweredOff.error_code(),
            "BLUETOOTH_ADAPTER_POWERED_OFF"
        );
        assert_eq!(
            XhaleError::SessionBusy("connected".into()).error_code(),
            "SESSION_BUSY"
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: XhaleError = TransportError::ConnectFailed {
            session_id: SessionId::from("a"),
            reason: "timeout".into(),
        }
        .into();
        assert!(matches!(err, XhaleError::ConnectionFailed(ref m) if m.contains("timeout")));

        let err: XhaleError = TransportError::PoweredOff.into();
        assert!(matches!(err, XhaleError::AdapterPoweredOff));
    }

    #[test]
    fn test_from_store_error() {
        let err: XhaleError = StoreError::Unavailable("offline".into()).into();
        assert!(err.is_persistence_error());
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
    }

    #[test]
    fn test_from_manager_error() {
        let err: XhaleError = ManagerError::Busy(ConnectionState::ServiceDiscovery).into();
        assert!(matches!(err, XhaleError::SessionBusy(ref s) if s == "service_discovery"));

        let err: XhaleError = ManagerError::UnknownDevice(SessionId::from("zz")).into();
        assert!(format!("{err}").contains("zz"));
    }

    #[test]
    fn test_from_config_validation_errors() {
        let err: XhaleError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "a".into(),
                message: "bad".into(),
            },
            ConfigError::ValidationError {
                field: "b".into(),
                message: "worse".into(),
            },
        ])
        .into();
        match err {
            XhaleError::ConfigValidationError(message) => {
                assert_eq!(message, "a: bad; b: worse");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<XhaleError>();
        assert_sync::<XhaleError>();
    }
}
