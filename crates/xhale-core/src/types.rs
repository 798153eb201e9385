//! Shared types and OpenAPI schemas.
//!
//! Identity types for the two identity spaces a sensor lives in (the
//! ephemeral transport session and the stable hardware address), decoded
//! readings, connection states, and the read-only snapshot the session
//! manager publishes to its consumers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

/// Identifier assigned by the platform Bluetooth stack to a discovered or
/// connected peripheral.
///
/// Not stable across reconnects: the stack may hand out a new id every time
/// the sensor is rediscovered. Never use it as a durable key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a transport-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable 6-byte hardware address of a physical sensor.
///
/// Extracted from advertisement manufacturer data, rendered as
/// `XX:XX:XX:XX:XX:XX` (uppercase hex). This is the only key used for
/// usage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Build an address from its six octets, most significant first.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The six octets of this address.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Error returned when a string is not a `XX:XX:XX:XX:XX:XX` address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hardware address '{0}': expected six colon-separated hex octets")]
pub struct ParseAddressError(pub String);

impl FromStr for HardwareAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseAddressError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseAddressError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The physical quantity a reading measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Temperature in degrees Celsius, hundredths resolution.
    Temperature,
    /// Carbon monoxide, raw instrument units.
    CarbonMonoxide,
}

/// A single decoded reading captured during a sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SensorReading {
    /// What was measured.
    pub kind: SensorKind,

    /// Value in physical units.
    #[schema(example = 36.5)]
    pub value: f64,

    /// When the reading was captured (UTC).
    pub captured_at: DateTime<Utc>,
}

/// Lifecycle of the single active sensor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no scan in progress.
    #[default]
    Disconnected,
    /// Scanning for sensors, nothing connected.
    Discovering,
    /// Connect requested, waiting for the transport.
    Connecting,
    /// Link is up, enumerating services and subscribing.
    ServiceDiscovery,
    /// Subscribed and streaming telemetry.
    Connected,
    /// Disconnect requested, waiting for the transport.
    Disconnecting,
}

impl ConnectionState {
    /// Whether a connection attempt or live link currently owns the session.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::Connected | Self::Disconnecting
        )
    }
}

/// A sensor seen in advertisements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "session_id": "4F1C2A9E-0D1B-4C55-9D0E-8E51B1F7D3A2",
    "hardware_address": "01:02:03:04:05:06",
    "name": "XHale-01",
    "rssi_dbm": -58,
    "last_seen_utc": "2025-01-15T03:30:00Z"
}))]
pub struct DiscoveredDevice {
    /// Transport session id used to connect.
    #[schema(value_type = String)]
    pub session_id: SessionId,

    /// Hardware address, once an advertisement carried it.
    #[schema(value_type = Option<String>, example = "01:02:03:04:05:06")]
    pub hardware_address: Option<HardwareAddress>,

    /// Advertised local name.
    pub name: Option<String>,

    /// Signal strength of the latest advertisement.
    pub rssi_dbm: Option<i16>,

    /// When the latest advertisement was processed.
    pub last_seen_utc: DateTime<Utc>,
}

/// Live usage total for one physical sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceDuration {
    /// Durable key of the sensor.
    #[schema(value_type = String, example = "01:02:03:04:05:06")]
    pub hardware_address: HardwareAddress,

    /// Cumulative connected seconds, including the running session.
    #[schema(example = 842.5)]
    pub seconds: f64,

    /// Whether a session for this sensor is currently running.
    pub active: bool,
}

/// Read-only view of everything the session manager owns.
///
/// Published after every state change; consumers never mutate it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct SessionSnapshot {
    /// Whether the Bluetooth adapter reported itself powered.
    pub adapter_powered: bool,

    /// Whether a scan is running.
    pub is_scanning: bool,

    /// Connection lifecycle state.
    pub state: ConnectionState,

    /// Session id of the device being connected or connected.
    #[schema(value_type = Option<String>)]
    pub current_device: Option<SessionId>,

    /// Hardware address of the current device, when resolved.
    #[schema(value_type = Option<String>)]
    pub current_address: Option<HardwareAddress>,

    /// Serial number read at connect time.
    pub serial_number: Option<String>,

    /// Whether a sampling window is open.
    pub sampling_active: bool,

    /// When the open timed sampling window closes.
    pub sampling_ends_at: Option<DateTime<Utc>>,

    /// Temperature readings of the current (or last) window.
    pub temperature: Vec<SensorReading>,

    /// Carbon monoxide readings of the current (or last) window.
    pub carbon_monoxide: Vec<SensorReading>,

    /// Sensors seen while scanning.
    pub discovered: Vec<DiscoveredDevice>,

    /// Per-sensor live usage totals.
    pub durations: Vec<DeviceDuration>,

    /// Characteristic payloads dropped because they were too short.
    pub decode_failures: u64,

    /// Set when the current session runs without usage tracking because its
    /// hardware address was never advertised.
    pub tracking_degraded: bool,
}

impl SessionSnapshot {
    /// Live duration for one sensor, if it has ever been tracked.
    #[must_use]
    pub fn duration_for(&self, address: &HardwareAddress) -> Option<f64> {
        self.durations
            .iter()
            .find(|d| &d.hardware_address == address)
            .map(|d| d.seconds)
    }
}
