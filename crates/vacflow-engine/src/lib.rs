/*!
 * vacflow Engine
 *
 * This crate keeps a robot's status current and acts on it: the status
 * snapshot and its cache, the refresh protocol that fills it, background
 * polling, and the command sequences behind start, stop and dock.
 */

#![warn(missing_docs)]

// Re-export core types
pub use vacflow_core::prelude;

pub mod cache;
pub mod client;
pub mod commands;
pub mod error;
pub mod poller;
pub mod refresh;
pub mod snapshot;

// Re-export main types for convenience
pub use cache::{NoValue, StatusCache, StatusReader};
pub use client::{ClientSettings, RobotClient};
pub use commands::{CommandSequencer, CommandSettings, DOCK_POLL_INTERVAL};
pub use error::{Error, Result};
pub use poller::{PollPurpose, PollScheduler, PollToken, INITIAL_POLL_RETRY};
pub use refresh::{StateRefresher, STATUS_TIMEOUT};
pub use snapshot::{StatusSnapshot, LOW_BATTERY_THRESHOLD};

/// vacflow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("vacflow Engine {} initialized", VERSION);
    Ok(())
}
