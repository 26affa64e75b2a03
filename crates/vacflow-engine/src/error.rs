/*!
 * Error types for the vacflow engine crate.
 */
use std::time::Duration;

use thiserror::Error;

/// Error type for vacflow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] vacflow_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] vacflow_core::error::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No complete status arrived in time
    #[error("Status refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    /// The robot reported something we could not act on
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The poll scheduler is no longer running
    #[error("Poll scheduler stopped")]
    SchedulerStopped,
}

/// Result type for vacflow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        Error::Configuration(msg.as_ref().to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidState(msg.as_ref().to_string())
    }
}
