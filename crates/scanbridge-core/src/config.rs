//! Application configuration management.
//!
//! Handles loading, saving and validating the bridge configuration:
//! - Scanning modules (serial path, optional id, baud rate, enabled flag)
//! - Default RSSI threshold and whether it overrides the host's value
//! - Dedup clear period and reconnect backoff policy
//! - Outward transport (HTTP+SSE or serial)
//! - Logging level and mode
//!
//! Files are TOML or JSON (picked by extension) and every key can be
//! overridden from the environment with the `SCANBRIDGE__` prefix, e.g.
//! `SCANBRIDGE__TRANSPORT__PORT=9000`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that points at the configuration file.
pub const CONFIG_PATH_ENV: &str = "SCANBRIDGE_CONFIG";

/// Prefix for environment overrides of individual keys.
pub const ENV_PREFIX: &str = "SCANBRIDGE";

/// Default RSSI threshold handed to the observer command.
pub const DEFAULT_RSSI: &str = "-60";

/// Default serial baud rate for modules and the serial transport.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").expect("static pattern"));

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The layered configuration could not be built or deserialized.
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] ::config::ConfigError),

    /// Writing the configuration file failed.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serializing the configuration to TOML failed.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// No device entry is enabled.
    #[error("At least one device must be enabled")]
    NoEnabledDevices,

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default RSSI threshold (signed decimal string, e.g. `"-60"`).
    pub rssi: String,

    /// When true the configured RSSI always wins over the host's value.
    pub use_config_rssi: bool,

    /// Period of the manufacturer dedup clear tick, in milliseconds.
    pub report_interval_ms: u64,

    /// Scanning modules attached over serial.
    pub devices: Vec<DeviceConfig>,

    /// Reconnect backoff for scanning modules.
    pub reconnect: ReconnectConfig,

    /// Outward transport selection.
    pub transport: TransportConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// One scanning module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub serial_path: String,

    /// Stable identifier; derived from `serial_path` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Disabled entries are ignored by the fleet.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Reconnect policy for scanning modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Failed attempts after which a device is given up.
    pub max_attempts: u32,

    /// Delay before the first attempt; doubles after each failure.
    pub base_delay_ms: u64,
}

/// Outward transport towards the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// HTTP commands plus a Server-Sent-Events stream.
    Http(HttpTransportConfig),
    /// Line-delimited JSON over a second serial link.
    Serial(SerialTransportConfig),
}

/// HTTP+SSE transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

/// Parity setting for the serial transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Serial transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialTransportConfig {
    /// Serial device path towards the host.
    pub serial_path: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits (5-8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Fixed delay between reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Reconnect attempts before the link is abandoned.
    pub max_reconnect_attempts: u32,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or `EnvFilter` directive, e.g. `info` or `scanbridge_core=debug`.
    pub level: String,
    /// JSON logs to rolling files plus compact stdout.
    pub production: bool,
    /// Override for the log directory in production mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

const fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

const fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rssi: DEFAULT_RSSI.to_string(),
            use_config_rssi: false,
            report_interval_ms: 5_000,
            devices: vec![DeviceConfig::new("/dev/ttyUSB0")],
            reconnect: ReconnectConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http(HttpTransportConfig::default())
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            serial_path: "/dev/ttyS1".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            production: false,
            directory: None,
        }
    }
}

impl DeviceConfig {
    /// An enabled device at `serial_path` with default settings.
    #[must_use]
    pub fn new(serial_path: impl Into<String>) -> Self {
        Self {
            serial_path: serial_path.into(),
            device_id: None,
            baud_rate: DEFAULT_BAUD_RATE,
            enabled: true,
        }
    }

    /// Sets an explicit device id.
    #[must_use]
    pub fn with_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// The id this device is known by: the configured one, or one derived
    /// from the serial path.
    #[must_use]
    pub fn resolved_id(&self) -> String {
        match &self.device_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => derive_device_id(&self.serial_path),
        }
    }
}

/// Derives a device id from a serial path by replacing every character
/// outside `[A-Za-z0-9]` with `_`.
#[must_use]
pub fn derive_device_id(serial_path: &str) -> String {
    NON_ALPHANUMERIC.replace_all(serial_path, "_").into_owned()
}

impl ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl AppConfig {
    /// Load configuration from `path`, layered with `SCANBRIDGE__*`
    /// environment overrides. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a key has the wrong type.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let builder = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from `path`, requiring the file to exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing, or any error
    /// from [`AppConfig::load`].
    pub fn load_existing(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load(path)
    }

    /// Save configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default configuration file path.
    ///
    /// `SCANBRIDGE_CONFIG` wins; otherwise `/etc/scanbridge/config.toml` on
    /// Linux and the platform config directory elsewhere.
    #[must_use]
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/scanbridge/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "scanbridge").map_or_else(
                || PathBuf::from("config.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Enabled device entries, in configuration order.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }

    /// Dedup clear period.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Validate the whole configuration, collecting every problem.
    ///
    /// # Errors
    ///
    /// Returns a single error, or [`ConfigError::MultipleValidationErrors`]
    /// when more than one field is wrong.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let enabled: Vec<&DeviceConfig> = self.enabled_devices().collect();
        if enabled.is_empty() {
            errors.push(ConfigError::NoEnabledDevices);
        }

        let mut paths = HashSet::new();
        let mut ids = HashSet::new();
        for (index, device) in enabled.iter().enumerate() {
            if device.serial_path.trim().is_empty() {
                errors.push(ConfigError::invalid(
                    format!("devices[{index}].serial_path"),
                    "must not be empty",
                ));
            }
            if !paths.insert(device.serial_path.as_str()) {
                errors.push(ConfigError::invalid(
                    format!("devices[{index}].serial_path"),
                    format!("duplicate serial path '{}'", device.serial_path),
                ));
            }
            if !ids.insert(device.resolved_id()) {
                errors.push(ConfigError::invalid(
                    format!("devices[{index}].device_id"),
                    format!("duplicate device id '{}'", device.resolved_id()),
                ));
            }
            if device.baud_rate == 0 {
                errors.push(ConfigError::invalid(
                    format!("devices[{index}].baud_rate"),
                    "must be greater than 0",
                ));
            }
        }

        if self.rssi.trim().parse::<i32>().is_err() {
            errors.push(ConfigError::invalid(
                "rssi",
                format!("'{}' is not a signed integer", self.rssi),
            ));
        }

        if self.report_interval_ms == 0 {
            errors.push(ConfigError::invalid("report_interval_ms", "must be greater than 0"));
        }

        match &self.transport {
            TransportConfig::Http(http) => {
                if http.port == 0 {
                    errors.push(ConfigError::invalid("transport.port", "must be 1-65535"));
                }
            }
            TransportConfig::Serial(serial) => {
                if serial.serial_path.trim().is_empty() {
                    errors.push(ConfigError::invalid(
                        "transport.serial_path",
                        "must not be empty",
                    ));
                }
                if serial.baud_rate == 0 {
                    errors.push(ConfigError::invalid(
                        "transport.baud_rate",
                        "must be greater than 0",
                    ));
                }
                if !(5..=8).contains(&serial.data_bits) {
                    errors.push(ConfigError::invalid(
                        "transport.data_bits",
                        "must be one of 5, 6, 7, 8",
                    ));
                }
                if !matches!(serial.stop_bits, 1 | 2) {
                    errors.push(ConfigError::invalid("transport.stop_bits", "must be 1 or 2"));
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}
