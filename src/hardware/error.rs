//! Driver-level error type shared by every capability trait.

use thiserror::Error;

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Opening or closing the device failed.
    Connection,
    /// Device was used before `connect`/`open`.
    NotConnected,
    /// Device reported a fault.
    Hardware,
    /// Motor driver raised its alarm output.
    Alarm,
    /// Device did not finish within the allotted time.
    Timeout,
    /// Caller passed a value the device cannot honour.
    InvalidParameter,
    /// Motion was interrupted by a stop request.
    Stopped,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Connection => "connection",
            DriverErrorKind::NotConnected => "not_connected",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Alarm => "alarm",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by a device driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{device}' {kind} error: {message}")]
pub struct DriverError {
    /// Device name (config key) that failed.
    pub device: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a new driver error.
    pub fn new(
        device: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Result alias used by capability traits.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
