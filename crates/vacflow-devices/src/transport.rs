/*!
 * Robot transport definitions for vacflow.
 *
 * The encrypted pub/sub client that actually talks to the robot lives outside
 * this workspace. This module is the boundary it plugs into: a connector that
 * opens a transport for a given cipher suite, and the transport itself, which
 * reports `connect`, `error` and `state` events and carries the robot's
 * imperative commands.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use vacflow_core::types::DeviceIdentity;

use crate::cipher::CipherSuite;
use crate::error::Result;

/// A fragment of the robot's reported state, as a JSON object
pub type RawState = Map<String, Value>;

/// Event emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is established
    Connect,
    /// The connection failed or broke
    Error(String),
    /// The robot reported (part of) its state
    State(RawState),
}

/// A single connection to a robot
///
/// Implementations start connecting when `connect` is called and report the
/// outcome through the event stream. `end` must be idempotent.
#[async_trait]
pub trait RobotTransport: Send + Sync + Debug {
    /// Subscribe to the transport's events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Start connecting
    fn connect(&self);

    /// Close the connection
    fn end(&self);

    /// Start a cleaning mission over the whole map
    async fn clean(&self) -> Result<()>;

    /// Start a room mission
    ///
    /// `mission` is the robot's own mission description, typically copied from
    /// its `lastCommand` report.
    async fn clean_room(&self, mission: &Value) -> Result<()>;

    /// Pause the current mission
    async fn pause(&self) -> Result<()>;

    /// Resume a paused mission
    async fn resume(&self) -> Result<()>;

    /// Send the robot back to its dock
    async fn dock(&self) -> Result<()>;

    /// Make the robot play its locate sound
    async fn find(&self) -> Result<()>;

    /// Wait for the robot to report the given top-level fields
    async fn get_robot_state(&self, fields: &[&str]) -> Result<RawState>;
}

/// Opens transports to robots
pub trait TransportConnector: Send + Sync + Debug {
    /// Get the connector name
    fn name(&self) -> &'static str;

    /// Create a transport for the robot using the given cipher suite
    ///
    /// The transport is not connected yet.
    fn open(
        &self,
        identity: &DeviceIdentity,
        cipher: &CipherSuite,
    ) -> Result<std::sync::Arc<dyn RobotTransport>>;
}
