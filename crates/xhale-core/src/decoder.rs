//! GATT characteristic decoding.
//!
//! Pure functions turning the sensor's fixed-length payloads into typed
//! values. A payload shorter than its characteristic requires fails with
//! [`DecodeError`]; callers drop the reading rather than surface the error.
//!
//! Carbon monoxide is passed through as the raw 16-bit instrument value. No
//! calibration curve is applied anywhere in this crate.

use thiserror::Error;
use uuid::{uuid, Uuid};

use crate::types::SensorKind;

/// Environmental Sensing service; also the scan filter.
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");

/// Temperature characteristic (uint16 hundredths, little-endian).
pub const TEMPERATURE_CHARACTERISTIC: Uuid = uuid!("00002a6e-0000-1000-8000-00805f9b34fb");

/// Carbon monoxide concentration characteristic (uint16, big-endian).
pub const CARBON_MONOXIDE_CHARACTERISTIC: Uuid = uuid!("00002bd0-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Serial Number String characteristic.
pub const SERIAL_NUMBER_CHARACTERISTIC: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

/// Serial number reported when the payload is not valid UTF-8.
pub const SERIAL_NUMBER_PLACEHOLDER: &str = "Unknown";

const TEMPERATURE_LEN: usize = 2;
const CARBON_MONOXIDE_LEN: usize = 2;

/// Errors that can occur while decoding a characteristic payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload is shorter than the characteristic's fixed length.
    #[error("{characteristic} payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort {
        /// Characteristic name.
        characteristic: &'static str,
        /// Required length.
        expected: usize,
        /// Received length.
        actual: usize,
    },
}

/// Characteristics the session manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Temperature notifications.
    Temperature,
    /// Carbon monoxide notifications.
    CarbonMonoxide,
    /// Serial number, read once.
    SerialNumber,
}

impl Characteristic {
    /// Every known characteristic.
    pub const ALL: [Self; 3] = [Self::Temperature, Self::CarbonMonoxide, Self::SerialNumber];

    /// Look up a characteristic by UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// The characteristic UUID.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Temperature => TEMPERATURE_CHARACTERISTIC,
            Self::CarbonMonoxide => CARBON_MONOXIDE_CHARACTERISTIC,
            Self::SerialNumber => SERIAL_NUMBER_CHARACTERISTIC,
        }
    }

    /// The service the characteristic belongs to.
    #[must_use]
    pub const fn service(self) -> Uuid {
        match self {
            Self::Temperature | Self::CarbonMonoxide => ENVIRONMENTAL_SENSING_SERVICE,
            Self::SerialNumber => DEVICE_INFORMATION_SERVICE,
        }
    }

    /// Reading kind produced by this characteristic, if it is a sensor.
    #[must_use]
    pub const fn sensor_kind(self) -> Option<SensorKind> {
        match self {
            Self::Temperature => Some(SensorKind::Temperature),
            Self::CarbonMonoxide => Some(SensorKind::CarbonMonoxide),
            Self::SerialNumber => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::CarbonMonoxide => "carbon monoxide",
            Self::SerialNumber => "serial number",
        }
    }
}

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A sensor reading in physical units.
    Reading(SensorKind, f64),
    /// The device serial number.
    SerialNumber(String),
}

/// Decode a payload for a known characteristic.
///
/// # Errors
///
/// Returns [`DecodeError::PayloadTooShort`] if the payload is shorter than
/// the characteristic's fixed length.
pub fn decode(characteristic: Characteristic, payload: &[u8]) -> Result<Decoded, DecodeError> {
    match characteristic {
        Characteristic::Temperature => {
            decode_temperature(payload).map(|v| Decoded::Reading(SensorKind::Temperature, v))
        }
        Characteristic::CarbonMonoxide => decode_carbon_monoxide(payload)
            .map(|v| Decoded::Reading(SensorKind::CarbonMonoxide, v)),
        Characteristic::SerialNumber => Ok(Decoded::SerialNumber(decode_serial_number(payload))),
    }
}

/// Decode a temperature payload: little-endian u16, hundredths of a degree.
///
/// # Errors
///
/// Returns [`DecodeError::PayloadTooShort`] for payloads under 2 bytes.
pub fn decode_temperature(payload: &[u8]) -> Result<f64, DecodeError> {
    let raw = u16::from_le_bytes(fixed(Characteristic::Temperature, payload, TEMPERATURE_LEN)?);
    Ok(f64::from(raw) / 100.0)
}

/// Decode a carbon monoxide payload: big-endian u16, raw passthrough.
///
/// # Errors
///
/// Returns [`DecodeError::PayloadTooShort`] for payloads under 2 bytes.
pub fn decode_carbon_monoxide(payload: &[u8]) -> Result<f64, DecodeError> {
    let raw = u16::from_be_bytes(fixed(
        Characteristic::CarbonMonoxide,
        payload,
        CARBON_MONOXIDE_LEN,
    )?);
    Ok(f64::from(raw))
}

/// Decode a serial number payload as UTF-8.
///
/// Invalid UTF-8 yields [`SERIAL_NUMBER_PLACEHOLDER`] instead of an error.
#[must_use]
pub fn decode_serial_number(payload: &[u8]) -> String {
    std::str::from_utf8(payload).map_or_else(
        |_| SERIAL_NUMBER_PLACEHOLDER.to_string(),
        |s| s.trim_end_matches('\0').to_string(),
    )
}

fn fixed(
    characteristic: Characteristic,
    payload: &[u8],
    len: usize,
) -> Result<[u8; 2], DecodeError> {
    payload
        .get(..len)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::PayloadTooShort {
            characteristic: characteristic.name(),
            expected: len,
            actual: payload.len(),
        })
}
