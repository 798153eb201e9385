//! # xhale-core
//!
//! Device session management for XHale breath sensors.
//!
//! This crate provides:
//! - Discovery of sensors from BLE advertisements, keyed by the hardware
//!   address embedded in manufacturer data
//! - A single-owner connection state machine that subscribes to the
//!   Environmental Sensing characteristics and reads the serial number
//! - Gated collection of temperature and CO readings into sampling windows
//! - Per-sensor usage duration tracking, persisted to a document store and
//!   recoverable after a crash
//!
//! ## Architecture
//!
//! - [`manager`] - The session state machine and its cloneable handle
//! - [`transport`] - The Bluetooth stack boundary (BlueZ or an in-process mock)
//! - [`advertisement`] - Discovered-device set and address extraction
//! - [`decoder`] - GATT payload decoding
//! - [`sampling`] - Sampling window and reading history
//! - [`duration`] - Usage duration accounting and remote reconciliation
//! - [`store`] - Document store boundary with memory and JSON-file backends
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error type for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod advertisement;
pub mod config;
pub mod decoder;
pub mod duration;
pub mod error;
pub mod manager;
pub mod sampling;
pub mod store;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use advertisement::{Advertisement, AdvertisementProcessor};
pub use config::{
    default_config_path, is_valid_hardware_address, BluetoothConfig, Config, ConfigError,
    SamplingConfig, ServerConfig, StoreConfig, TrackingConfig, MAX_SAMPLE_SECS, MIN_SAMPLE_SECS,
};
pub use decoder::{decode, Characteristic, DecodeError, Decoded};
pub use duration::{DurationRecord, DurationTracker, FinalTotal};
pub use error::{Result, XhaleError};
pub use manager::{ManagerError, ManagerSettings, SessionEvent, SessionHandle, SessionManager};
pub use sampling::{SampleSummary, SamplingGate};
pub use store::{
    default_data_dir, DocumentKey, Fields, JsonFileStore, MemoryStore, RemoteStore, StoreError,
};
#[cfg(feature = "bluetooth")]
pub use transport::BluerTransport;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use transport::{MockDevice, MockTransport};
pub use transport::{Transport, TransportError, TransportEvent};
pub use types::{
    ConnectionState, DeviceDuration, DiscoveredDevice, HardwareAddress, SensorKind,
    SensorReading, SessionId, SessionSnapshot,
};
