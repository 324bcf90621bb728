//! Custom error types for the colorimeter core.
//!
//! `ColorimeterError` is the single error type returned by the managers, the
//! through-focus engine and the calibration pipeline. Using `thiserror`, it
//! consolidates driver faults, timeouts, configuration problems, fan-out
//! partial failures and user-requested stops.
//!
//! ## Error taxonomy
//!
//! Every error maps onto an [`ErrorKind`]:
//!
//! - **`Hardware`**: a device reported a fault or alarm, or was not connected.
//! - **`Timeout`**: a bounded wait expired.
//! - **`Configuration`**: invalid or missing configuration, detected before any
//!   hardware motion is issued.
//! - **`PartialFailure`**: a fan-out where some modules succeeded and others failed.
//! - **`UserStop`**: the operation was cancelled by an explicit stop.
//! - **`NoPeak`**: through-focus sampled the range but found no finite peak.
//! - **`Processing`**: a calibration stage could not be applied.
//!
//! Callers that need the flat `{success, message, code}` triple use
//! [`OperationResult`], where `code` is `0` for run-time failures and `1` for a
//! user stop.

use crate::hardware::error::{DriverError, DriverErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ColorimeterError>;

/// Coarse category of a [`ColorimeterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Device fault, alarm or missing connection.
    Hardware,
    /// Wait exceeded its bound.
    Timeout,
    /// Invalid or missing configuration.
    Configuration,
    /// Some modules of a fan-out failed.
    PartialFailure,
    /// Explicit cancellation.
    UserStop,
    /// Through-focus found no usable peak.
    NoPeak,
    /// Calibration stage failure.
    Processing,
}

/// Numeric result code carried by [`OperationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Run-time or hardware error; the caller may retry.
    Runtime = 0,
    /// User-initiated stop; never retried automatically.
    UserStop = 1,
}

impl ResultCode {
    /// Integer form of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum ColorimeterError {
    #[error(transparent)]
    Device(#[from] DriverError),

    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Operation failed on modules {failed:?}: {message}")]
    PartialFailure { failed: Vec<i32>, message: String },

    #[error("Stopped by user: {0}")]
    UserStop(String),

    #[error("No focus peak found: {0}")]
    NoPeak(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Calibration processing error: {0}")]
    Processing(String),

    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ColorimeterError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ColorimeterError::Configuration(message.into())
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ColorimeterError::Device(err) => match err.kind {
                DriverErrorKind::Timeout => ErrorKind::Timeout,
                DriverErrorKind::Stopped => ErrorKind::UserStop,
                DriverErrorKind::InvalidParameter => ErrorKind::Configuration,
                DriverErrorKind::Connection
                | DriverErrorKind::NotConnected
                | DriverErrorKind::Hardware
                | DriverErrorKind::Alarm => ErrorKind::Hardware,
            },
            ColorimeterError::Timeout { .. } => ErrorKind::Timeout,
            ColorimeterError::Configuration(_)
            | ColorimeterError::NotFound(_)
            | ColorimeterError::InsufficientData(_)
            | ColorimeterError::Config(_) => ErrorKind::Configuration,
            ColorimeterError::NotConnected(_) => ErrorKind::Hardware,
            ColorimeterError::PartialFailure { .. } => ErrorKind::PartialFailure,
            ColorimeterError::UserStop(_) => ErrorKind::UserStop,
            ColorimeterError::NoPeak(_) => ErrorKind::NoPeak,
            ColorimeterError::Processing(_) => ErrorKind::Processing,
            ColorimeterError::Io(_)
            | ColorimeterError::Json(_)
            | ColorimeterError::Csv(_)
            | ColorimeterError::Image(_)
            | ColorimeterError::Storage(_) => ErrorKind::Processing,
        }
    }

    /// Result code: `UserStop` for cancellations, `Runtime` otherwise.
    pub fn code(&self) -> ResultCode {
        match self.kind() {
            ErrorKind::UserStop => ResultCode::UserStop,
            _ => ResultCode::Runtime,
        }
    }

    /// True when the error was caused by an explicit stop.
    pub fn is_user_stop(&self) -> bool {
        self.kind() == ErrorKind::UserStop
    }
}

/// Flat `{success, message, code}` report of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Empty on success, otherwise a description of the failure.
    pub message: String,
    /// `Runtime` (0) or `UserStop` (1).
    pub code: ResultCode,
}

impl OperationResult {
    /// Successful report.
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
            code: ResultCode::Runtime,
        }
    }

    /// Failure report built from an error.
    pub fn from_error(err: &ColorimeterError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            code: err.code(),
        }
    }
}

impl<T> From<&AppResult<T>> for OperationResult {
    fn from(value: &AppResult<T>) -> Self {
        match value {
            Ok(_) => OperationResult::ok(),
            Err(err) => OperationResult::from_error(err),
        }
    }
}
