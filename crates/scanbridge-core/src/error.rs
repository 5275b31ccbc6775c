//! Unified error types for the scanbridge core library.
//!
//! [`BridgeError`] covers every failure mode of the bridge: serial channel
//! problems, device state conflicts, host protocol violations and
//! configuration mistakes. Module-specific errors (such as
//! [`ConfigError`](crate::config::ConfigError)) convert into it.
//!
//! # Design Principles
//!
//! - **Specific variants**: each variant captures exactly one failure mode
//! - **Actionable messages**: messages and [`BridgeError::suggestion`] guide operators
//! - **Wire-ready**: every error has a stable [`BridgeError::error_code`] for the
//!   host protocol and an HTTP status for the HTTP transport
//!
//! # Example
//!
//! ```rust
//! use scanbridge_core::error::{BridgeError, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(BridgeError::DeviceNotFound(id.to_string()))
//! }
//!
//! assert_eq!(lookup("dongle-1").unwrap_err().error_code(), "DEVICE_NOT_FOUND");
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all scanbridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // DEVICE / CHANNEL ERRORS
    // =========================================================================
    /// The serial channel for a scanning module could not be opened.
    #[error("Failed to open serial channel {path}: {message}")]
    ChannelOpen {
        /// Serial path that failed to open.
        path: String,
        /// Underlying failure.
        message: String,
    },

    /// Writing an AT command to a scanning module failed.
    #[error("Failed to write to device {device_id}: {message}")]
    ChannelWrite {
        /// Device the write was addressed to.
        device_id: String,
        /// Underlying failure.
        message: String,
    },

    /// The device is running its bring-up sequence and cannot accept commands yet.
    #[error("Device {0} is initializing, try again once bring-up completes")]
    DeviceBusy(String),

    /// No live device with this id exists.
    #[error("Device not found: '{0}'")]
    DeviceNotFound(String),

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================
    /// The configuration enables no scanning modules.
    #[error("No enabled devices configured")]
    NoEnabledDevices,

    /// Startup finished with no connected devices and no pending retries.
    #[error("No devices connected and none are retrying")]
    NoDevicesAvailable,

    /// The fleet is shutting down and refuses new work.
    #[error("Fleet is shutting down")]
    ShuttingDown,

    // =========================================================================
    // HOST PROTOCOL ERRORS
    // =========================================================================
    /// The host sent a payload that is not a valid request envelope.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The host sent a command code this bridge does not implement.
    #[error("Unknown command: {0}")]
    UnknownCommand(i64),

    /// The outward transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // INTERNAL & I/O ERRORS
    // =========================================================================
    /// An unexpected failure while executing a command.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for scanbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Returns `true` if this error concerns a scanning module or its channel.
    #[inline]
    #[must_use]
    pub const fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpen { .. }
                | Self::ChannelWrite { .. }
                | Self::DeviceBusy(_)
                | Self::DeviceNotFound(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_)
                | Self::ConfigParseError(_)
                | Self::ConfigValidationError(_)
                | Self::NoEnabledDevices
        )
    }

    /// Returns `true` if the host sent something this bridge cannot decode.
    #[inline]
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::UnknownCommand(_))
    }

    /// Returns `true` if the reconnect scheduler is expected to recover from this error.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpen { .. } | Self::ChannelWrite { .. } | Self::DeviceBusy(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::UnknownCommand(_) => 400,
            Self::DeviceNotFound(_) | Self::ConfigNotFound(_) => 404,
            Self::DeviceBusy(_) => 409,
            Self::ChannelOpen { .. }
            | Self::ChannelWrite { .. }
            | Self::NoDevicesAvailable
            | Self::ShuttingDown
            | Self::Transport(_) => 503,
            Self::NoEnabledDevices
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_)
            | Self::Internal(_)
            | Self::IoError(_) => 500,
        }
    }

    /// Returns a machine-readable error code for the host protocol.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ChannelOpen { .. } => "CHANNEL_OPEN_FAILED",
            Self::ChannelWrite { .. } => "CHANNEL_WRITE_FAILED",
            Self::DeviceBusy(_) => "DEVICE_BUSY",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::NoEnabledDevices => "NO_ENABLED_DEVICES",
            Self::NoDevicesAvailable => "NO_DEVICES_AVAILABLE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }

    /// Returns an operator-facing hint, when one exists.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ChannelOpen { .. } => {
                Some("Check that the module is plugged in and the serial path is correct")
            }
            Self::ChannelWrite { .. } => Some("The device will be reconnected automatically"),
            Self::DeviceBusy(_) => Some("Retry after the device finishes initializing"),
            Self::DeviceNotFound(_) => Some("Omit 'did' to address every connected device"),
            Self::InvalidRequest(_) => {
                Some("Send a JSON object of the form {\"c\": <code>, \"d\": {...}}")
            }
            Self::UnknownCommand(_) => Some("Supported command codes: 1 (start), 2 (stop), 3 (heartbeat)"),
            Self::NoEnabledDevices => Some("Enable at least one entry under [[devices]]"),
            _ => None,
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BridgeError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::WriteError { path, source } => Self::ConfigParseError(format!(
                "Failed to write {}: {}",
                path.display(),
                source
            )),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::NoEnabledDevices => Self::NoEnabledDevices,
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                if errors
                    .iter()
                    .any(|e| matches!(e, ConfigError::NoEnabledDevices))
                {
                    return Self::NoEnabledDevices;
                }
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_device_error_classification() {
        assert!(BridgeError::DeviceBusy("d0".into()).is_device_error());
        assert!(BridgeError::DeviceNotFound("d0".into()).is_device_error());
        assert!(BridgeError::ChannelOpen {
            path: "/dev/ttyUSB0".into(),
            message: "no such file".into()
        }
        .is_device_error());

        assert!(!BridgeError::UnknownCommand(99).is_device_error());
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(BridgeError::UnknownCommand(99).is_protocol_error());
        assert!(BridgeError::InvalidRequest("eof".into()).is_protocol_error());
        assert!(!BridgeError::NoEnabledDevices.is_protocol_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(BridgeError::NoEnabledDevices.is_config_error());
        assert!(BridgeError::ConfigNotFound(PathBuf::from("/etc/x.toml")).is_config_error());
        assert!(!BridgeError::ShuttingDown.is_config_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(BridgeError::ChannelWrite {
            device_id: "d0".into(),
            message: "broken pipe".into()
        }
        .is_recoverable());
        assert!(!BridgeError::DeviceNotFound("d0".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(BridgeError::UnknownCommand(7).http_status_code(), 400);
        assert_eq!(BridgeError::DeviceNotFound("x".into()).http_status_code(), 404);
        assert_eq!(BridgeError::DeviceBusy("x".into()).http_status_code(), 409);
        assert_eq!(BridgeError::Internal("boom".into()).http_status_code(), 500);
        assert_eq!(BridgeError::ShuttingDown.http_status_code(), 503);
    }

    #[test]
    fn test_error_codes_and_suggestions() {
        let err = BridgeError::UnknownCommand(99);
        assert_eq!(err.error_code(), "UNKNOWN_COMMAND");
        assert!(err.suggestion().is_some());
        assert!(BridgeError::ShuttingDown.suggestion().is_none());
    }

    #[test]
    fn test_from_io_error() {
        let err: BridgeError = IoErr::new(ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, BridgeError::IoError(_)));
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_error_display_messages() {
        assert!(BridgeError::DeviceNotFound("dongle-3".into())
            .to_string()
            .contains("dongle-3"));
        assert!(BridgeError::UnknownCommand(99).to_string().contains("99"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BridgeError>();
        assert_sync::<BridgeError>();
    }
}
