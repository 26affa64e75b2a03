/*!
 * Error types for robot connections and commands.
 */
use std::time::Duration;

use thiserror::Error;

/// Error type for device operations
///
/// Cloneable so that one failed connection attempt can be reported to every
/// borrower that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No connect or error event arrived in time
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The robot rejected the cipher or client identity
    #[error("Transport rejected: {0}")]
    TransportRejected(String),

    /// The transport failed in a way another cipher will not fix
    #[error("Transport error: {0}")]
    TransportFatal(String),

    /// The robot rejected or failed an imperative command
    #[error("Command {command} failed: {message}")]
    CommandFailed {
        /// The command name
        command: String,
        /// The reason reported by the transport
        message: String,
    },

    /// The robot reported something we could not interpret
    #[error("Invalid state report: {0}")]
    InvalidState(String),

    /// The session ended before the operation finished
    #[error("Session closed")]
    SessionClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new command failure
    pub fn command_failed<C: AsRef<str>, M: AsRef<str>>(command: C, message: M) -> Self {
        DeviceError::CommandFailed {
            command: command.as_ref().to_string(),
            message: message.as_ref().to_string(),
        }
    }

    /// Whether the error came from establishing the connection
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectTimeout(_)
                | DeviceError::TransportRejected(_)
                | DeviceError::TransportFatal(_)
        )
    }
}
