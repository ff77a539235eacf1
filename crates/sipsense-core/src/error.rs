//! Error types for the sipsense core library.
//!
//! Each component owns a narrow error enum ([`ConnectionError`], [`DecodeError`],
//! [`CalibrationError`], [`StorageError`]). The unified [`SipsenseError`] wraps the
//! ones that reach callers of the orchestrator; decode errors stay in the pipeline.
//!
//! # Propagation
//!
//! - **Connection errors** are retried internally with backoff and only surface as
//!   [`ConnectionError::Lost`] once the retry budget is spent. Errors from an explicit
//!   `connect` call surface directly.
//! - **Decode errors** never leave the pipeline: they are counted and logged.
//! - **Calibration and storage errors** propagate synchronously to whoever triggered
//!   the operation.
//!
//! # Example
//!
//! ```rust
//! use sipsense_core::error::{CalibrationError, Result, SipsenseError};
//!
//! fn check_volume(volume_ml: f64) -> Result<()> {
//!     if volume_ml <= 0.0 {
//!         return Err(CalibrationError::InvalidProfile("bottle volume must be positive".into()).into());
//!     }
//!     Ok(())
//! }
//!
//! assert!(matches!(check_volume(0.0), Err(SipsenseError::Calibration(_))));
//! ```


use thiserror::Error;
use uuid::Uuid;

use crate::types::{ConnectionState, DeviceId};

// =============================================================================
// COMPONENT ERRORS
// =============================================================================

/// Failures of the physical link lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Scan found no candidate, or a connect attempt did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The peripheral or the radio stack refused the connection.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// The radio stack is not initialised or the adapter is powered off.
    #[error("Bluetooth radio not ready. Ensure the adapter is present and powered on.")]
    NotReady,

    /// The link dropped and every reconnection attempt failed.
    #[error("Connection lost after {attempts} reconnection attempts")]
    Lost {
        /// Number of reconnection attempts made before giving up.
        attempts: u32,
    },

    /// A connection attempt is already in flight; the new request is rejected.
    #[error("A connection attempt is already in progress")]
    Busy,

    /// The operation is not valid from the current state.
    #[error("Operation not allowed while {0}")]
    InvalidState(ConnectionState),

    /// The operation was abandoned by `disconnect` or `stop_scan`.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Failures turning a notification payload into a reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload does not match the frame schema.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// No frame was accepted within the freshness window.
    #[error("No telemetry for {silent_ms} ms")]
    Stale {
        /// Time since the last accepted frame (or since the link came up).
        silent_ms: u64,
    },
}

/// Failures mapping distance to volume, or setting up a profile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// Distance below the minimum valid reading (obstruction or no bottle).
    #[error("Distance {distance_mm} mm is below the minimum valid reading of {min_mm} mm")]
    InvalidRange {
        /// The rejected distance.
        distance_mm: u32,
        /// The configured minimum.
        min_mm: u32,
    },

    /// Calibration points or bottle volume are unusable.
    #[error("Invalid calibration: {0}")]
    InvalidProfile(String),

    /// The device has no saved calibration profile.
    #[error("Device is not calibrated")]
    NotCalibrated,
}

/// Opaque failure reported by the storage collaborator.
#[derive(Debug, Error)]
#[error("Storage failure: {message}")]
pub struct StorageError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    /// Create a storage error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

// =============================================================================
// UNIFIED ERROR
// =============================================================================

/// The unified error type for all sipsense operations.
#[derive(Debug, Error)]
pub enum SipsenseError {
    /// Link lifecycle failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Calibration failure.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Storage collaborator failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The operation needs a connected (or connecting) device.
    #[error("No active device. Connect to a bottle first.")]
    NoActiveDevice,

    /// No session exists for the device.
    #[error("Unknown device: '{0}'")]
    UnknownDevice(DeviceId),

    /// No alert with this id in any session.
    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),
}

/// A specialized [`Result`] type for sipsense operations.
pub type Result<T> = std::result::Result<T, SipsenseError>;

impl SipsenseError {
    /// Returns `true` if this error comes from the link lifecycle.
    #[inline]
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` if this error comes from calibration.
    #[inline]
    #[must_use]
    pub const fn is_calibration_error(&self) -> bool {
        matches!(self, Self::Calibration(_))
    }

    /// Returns `true` if this error comes from the storage collaborator.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::Calibration(CalibrationError::InvalidProfile(_)) => 400,

            // 404 Not Found
            Self::UnknownDevice(_) | Self::AlertNotFound(_) => 404,

            // 409 Conflict - wrong state for the request
            Self::Connection(
                ConnectionError::Busy
                | ConnectionError::InvalidState(_)
                | ConnectionError::Cancelled,
            ) => 409,

            // 422 Unprocessable Entity - reading outside the usable range
            Self::Calibration(CalibrationError::InvalidRange { .. }) => 422,

            // 424 Failed Dependency - prerequisites not met
            Self::NoActiveDevice | Self::Calibration(CalibrationError::NotCalibrated) => 424,

            // 500 Internal Server Error
            Self::Storage(_) => 500,

            // 502 Bad Gateway - peripheral refused
            Self::Connection(ConnectionError::Rejected(_)) => 502,

            // 503 Service Unavailable - radio issues
            Self::Connection(ConnectionError::NotReady | ConnectionError::Lost { .. }) => 503,

            // 504 Gateway Timeout
            Self::Connection(ConnectionError::Timeout) => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(err) => match err {
                ConnectionError::Timeout => "CONNECTION_TIMEOUT",
                ConnectionError::Rejected(_) => "CONNECTION_REJECTED",
                ConnectionError::NotReady => "RADIO_NOT_READY",
                ConnectionError::Lost { .. } => "CONNECTION_LOST",
                ConnectionError::Busy => "CONNECTION_BUSY",
                ConnectionError::InvalidState(_) => "INVALID_CONNECTION_STATE",
                ConnectionError::Cancelled => "CANCELLED",
            },
            Self::Calibration(err) => match err {
                CalibrationError::InvalidRange { .. } => "INVALID_RANGE",
                CalibrationError::InvalidProfile(_) => "INVALID_CALIBRATION",
                CalibrationError::NotCalibrated => "NOT_CALIBRATED",
            },
            Self::Storage(_) => "STORAGE_ERROR",
            Self::NoActiveDevice => "NO_ACTIVE_DEVICE",
            Self::UnknownDevice(_) => "UNKNOWN_DEVICE",
            Self::AlertNotFound(_) => "ALERT_NOT_FOUND",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
