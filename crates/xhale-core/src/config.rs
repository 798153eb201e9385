//! Session manager configuration.
//!
//! Loaded from a TOML file, with `XHALE_<SECTION>__<KEY>` environment
//! variables layered on top:
//!
//! ```toml
//! [bluetooth]
//! service_uuid = "0000181a-0000-1000-8000-00805f9b34fb"
//! adapter = "hci0"
//!
//! [sampling]
//! duration_secs = 15
//! start_on_connect = true
//!
//! [tracking]
//! tick_interval_ms = 1000
//! retry_interval_secs = 30
//!
//! [store]
//! account_id = "local"
//! data_dir = "/var/lib/xhale"
//!
//! [server]
//! bind_address = "0.0.0.0:3000"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decoder::ENVIRONMENTAL_SENSING_SERVICE;

/// Shortest selectable sampling window.
pub const MIN_SAMPLE_SECS: u64 = 5;

/// Longest selectable sampling window.
pub const MAX_SAMPLE_SECS: u64 = 60;

static HARDWARE_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("hardware address pattern")
});

static ACCOUNT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("account id pattern"));

/// Whether a string looks like `XX:XX:XX:XX:XX:XX`.
#[must_use]
pub fn is_valid_hardware_address(s: &str) -> bool {
    HARDWARE_ADDRESS_RE.is_match(s)
}

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file or environment could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} validation errors: {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Bluetooth settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Service UUID used as the scan filter.
    pub service_uuid: Uuid,
    /// Adapter name (e.g. `hci0`); the system default when unset.
    pub adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            service_uuid: ENVIRONMENTAL_SENSING_SERVICE,
            adapter: None,
        }
    }
}

/// Sampling window settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Length of a timed sampling window.
    pub duration_secs: u64,
    /// Open an untimed window as soon as a sensor is connected.
    pub start_on_connect: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            duration_secs: 15,
            start_on_connect: true,
        }
    }
}

/// Usage tracking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Period of the live-duration tick.
    pub tick_interval_ms: u64,
    /// Minimum gap between retries of a failed final duration write.
    pub retry_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            retry_interval_secs: 30,
        }
    }
}

/// Remote store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Account whose documents are read and written.
    pub account_id: String,
    /// Directory of the on-disk document store.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            account_id: "local".to_string(),
            data_dir: crate::store::default_data_dir(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,
    /// Sampling settings.
    pub sampling: SamplingConfig,
    /// Tracking settings.
    pub tracking: TrackingConfig,
    /// Store settings.
    pub store: StoreConfig,
    /// Server settings.
    pub server: ServerConfig,
}

impl Config {
    /// Load and validate configuration from `path` plus the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing, a parse
    /// error for malformed input, or the validation errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::build(Some(path))
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    /// (still overridable from the environment).
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Self::build(path.exists().then_some(path))
    }

    fn build(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }
        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix("XHALE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its directory cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single [`ConfigError::ValidationError`], or
    /// [`ConfigError::MultipleValidationErrors`] when several fields fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.bluetooth.service_uuid.is_nil() {
            errors.push(ConfigError::invalid(
                "bluetooth.service_uuid",
                "must not be the nil UUID",
            ));
        }
        if self.bluetooth.adapter.as_deref().is_some_and(str::is_empty) {
            errors.push(ConfigError::invalid(
                "bluetooth.adapter",
                "must not be empty when set",
            ));
        }
        if !(MIN_SAMPLE_SECS..=MAX_SAMPLE_SECS).contains(&self.sampling.duration_secs) {
            errors.push(ConfigError::invalid(
                "sampling.duration_secs",
                format!(
                    "must be between {MIN_SAMPLE_SECS} and {MAX_SAMPLE_SECS}, got {}",
                    self.sampling.duration_secs
                ),
            ));
        }
        if self.tracking.tick_interval_ms == 0 {
            errors.push(ConfigError::invalid(
                "tracking.tick_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.tracking.retry_interval_secs == 0 {
            errors.push(ConfigError::invalid(
                "tracking.retry_interval_secs",
                "must be greater than zero",
            ));
        }
        if !ACCOUNT_ID_RE.is_match(&self.store.account_id) {
            errors.push(ConfigError::invalid(
                "store.account_id",
                "must be non-empty and contain only letters, digits, '.', '_' or '-'",
            ));
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::invalid(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Default length of a timed sampling window.
    #[must_use]
    pub const fn sample_length(&self) -> Duration {
        Duration::from_secs(self.sampling.duration_secs)
    }

    /// Period of the live-duration tick.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tracking.tick_interval_ms)
    }

    /// Gap between retries of a failed final write.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.tracking.retry_interval_secs)
    }
}

/// Default configuration file location.
///
/// On Linux: `/etc/xhale/config.toml`
/// Elsewhere: the platform config directory for `xhale`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/xhale/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "xhale").map_or_else(
            || PathBuf::from("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.duration_secs, 15);
        assert!(config.sampling.start_on_connect);
        assert_eq!(config.bluetooth.service_uuid, ENVIRONMENTAL_SENSING_SERVICE);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_hardware_address_pattern() {
        assert!(is_valid_hardware_address("01:02:03:04:05:06"));
        assert!(is_valid_hardware_address("aa:BB:cc:DD:ee:FF"));
        assert!(!is_valid_hardware_address("01:02:03:04:05"));
        assert!(!is_valid_hardware_address("01-02-03-04-05-06"));
        assert!(!is_valid_hardware_address("GG:02:03:04:05:06"));
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = Config::default();
        config.sampling.duration_secs = 61;
        match config.validate() {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "sampling.duration_secs");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.sampling.duration_secs = 1;
        config.tracking.tick_interval_ms = 0;
        config.store.account_id = "a/b".to_string();
        config.server.bind_address = "nowhere".to_string();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.sampling.duration_secs = 30;
        config.store.account_id = "alice".to_string();
        config.store.data_dir = dir.path().join("data");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampling]\nduration_secs = 45\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sampling.duration_secs, 45);
        assert!(loaded.sampling.start_on_connect);
        assert_eq!(loaded.server, ServerConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));
        assert!(Config::load_or_default(&path).is_ok());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampling]\nduration_secs = 2\n").unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
