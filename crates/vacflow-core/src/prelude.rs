/*!
 * Prelude module for vacflow Core.
 *
 * This module re-exports commonly used types and functions from the vacflow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DeviceIdentity, SharedSecret};

// Re-export config types
pub use crate::config::{
    AccessoryConfig, BehaviourConfig, CleanBehaviour, Config, ConfigBuilder, SharedConfig,
    StopBehaviour,
};

// Re-export utility functions
pub use crate::utils::{format_duration, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
