/*!
 * vacflow Devices
 *
 * This crate owns everything between the robot's transport and the status
 * engine: the transport boundary, the vocabulary of the robot's state reports,
 * cipher suite fallback, and the single shared session per robot.
 */

#![warn(missing_docs)]

// Re-export core types
pub use vacflow_core::prelude;

pub mod cipher;
pub mod error;
pub mod protocols;
pub mod session;
pub mod state;
pub mod transport;

pub use cipher::{CipherNegotiator, CipherSuite, FailureClass, FailureClassifier, ROBOT_CIPHERS};
pub use error::{DeviceError, Result};
pub use session::{Session, SessionHolder, SessionLease, StatusSink, CONNECT_TIMEOUT};
pub use state::MissionPhase;
pub use transport::{RawState, RobotTransport, TransportConnector, TransportEvent};

/// vacflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<()> {
    tracing::info!("vacflow Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = Vec::new();

    #[cfg(feature = "simulated")]
    transports.push("simulated");

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_transports() {
        assert_eq!(available_transports().contains(&"simulated"), cfg!(feature = "simulated"));
    }
}
