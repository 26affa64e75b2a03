/*!
 * vacflow Core
 *
 * This crate provides the shared foundation of the vacflow robot client:
 * configuration, logging, robot identity types, and small async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use futures;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
}

/// vacflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("vacflow Core {} initialized", VERSION);
    Ok(())
}
