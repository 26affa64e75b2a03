/*!
 * Transport implementations for vacflow.
 *
 * The production transport is supplied by the host. This module carries the
 * in-process simulated robot used by tests and demos.
 */

#[cfg(feature = "simulated")]
pub mod simulated;

#[cfg(feature = "simulated")]
pub use simulated::{ConnectBehaviour, RobotCommand, SimulatedConnector, SimulatedTransport};
