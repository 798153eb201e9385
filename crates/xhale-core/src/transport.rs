//! BLE transport abstraction.
//!
//! The session manager never talks to a Bluetooth stack directly. It drives
//! a [`Transport`] through request-style calls and receives everything the
//! stack reports on its own (advertisements, notifications, link loss,
//! adapter power) as [`TransportEvent`]s on a channel.
//!
//! Implementations:
//!
//! - [`BluerTransport`] - BlueZ over D-Bus (feature `bluetooth`, Linux)
//! - [`MockTransport`] - scripted in-process peripherals for tests and
//!   development hosts without a radio

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::advertisement::Advertisement;
use crate::types::SessionId;

#[cfg(feature = "bluetooth")]
mod bluez;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
mod mock;

#[cfg(feature = "bluetooth")]
pub use self::bluez::BluerTransport;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use self::mock::{MockCall, MockDevice, MockTransport};

/// Receiving side of a transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Errors reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The adapter is present but powered off.
    #[error("Bluetooth adapter is powered off")]
    PoweredOff,

    /// The transport does not know the session id.
    #[error("Unknown device: {0}")]
    UnknownDevice(SessionId),

    /// Starting or stopping a scan failed.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// The link could not be established.
    #[error("Failed to connect to {session_id}: {reason}")]
    ConnectFailed {
        /// Device that was being connected.
        session_id: SessionId,
        /// Stack-reported reason.
        reason: String,
    },

    /// Service or characteristic enumeration failed, or a required service
    /// is missing.
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Enabling notifications failed.
    #[error("Failed to subscribe to {characteristic}: {reason}")]
    SubscribeFailed {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Stack-reported reason.
        reason: String,
    },

    /// A characteristic read failed.
    #[error("Failed to read {characteristic}: {reason}")]
    ReadFailed {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Stack-reported reason.
        reason: String,
    },

    /// Tearing down the link failed.
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// A GATT service exposed by a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
}

/// A GATT characteristic and the operations it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supports notify or indicate.
    pub notify: bool,
    /// Supports read.
    pub read: bool,
}

/// Something the Bluetooth stack reported without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement was received while scanning.
    Discovered(Advertisement),

    /// A subscribed characteristic delivered a value.
    Notification {
        /// Device that sent it.
        session_id: SessionId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Raw payload.
        payload: Vec<u8>,
    },

    /// A link went down without a disconnect request.
    Disconnected {
        /// Device whose link dropped.
        session_id: SessionId,
        /// Stack-reported reason.
        reason: Option<String>,
    },

    /// The adapter's power state changed (also sent once on start-up).
    AdapterPowered(bool),
}

/// Request side of a BLE central.
///
/// Calls complete when the stack has acknowledged the request. Values that
/// arrive later are delivered as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError>;

    /// Stop the running scan. No-op if none is running.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Establish a link.
    async fn connect(&self, session_id: &SessionId) -> Result<(), TransportError>;

    /// Enumerate the services of a connected peripheral.
    async fn discover_services(&self, session_id: &SessionId)
        -> Result<Vec<ServiceInfo>, TransportError>;

    /// Enumerate the characteristics of one service.
    async fn discover_characteristics(
        &self,
        session_id: &SessionId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError>;

    /// Enable notifications; values arrive as [`TransportEvent::Notification`].
    async fn subscribe(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Read a characteristic once.
    async fn read(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    /// Tear down a link. Completion means the link is down.
    async fn disconnect(&self, session_id: &SessionId) -> Result<(), TransportError>;
}
