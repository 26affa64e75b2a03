/*!
 * Logging functionality for vacflow.
 *
 * This module provides tracing setup and span helpers so every crate in the
 * workspace logs the same way.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "vacflow_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Initialize the logging system from the `[logging]` configuration section
///
/// `debug` forces the `debug` level regardless of the configured one.
pub fn init_from_config(config: &LoggingConfig, debug: bool) -> Result<()> {
    if !config.stdout {
        return Ok(());
    }
    let level = if debug { "debug" } else { config.level.as_str() };
    init_with_filter(level)
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

/// Create a span that tags everything logged inside it with the robot's name
pub fn device_span(name: &str, local_id: &str) -> Span {
    tracing::info_span!("robot", name = %name, blid = %local_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second initialisation in the same process fails, which is fine here
        let _ = init();
    }

    #[test]
    fn test_spans_can_be_entered() {
        let span = component_span("test", Some("123"));
        assert_eq!(span.in_scope(|| 1), 1);

        let span = operation_span("refresh", "cache");
        assert_eq!(span.in_scope(|| 2), 2);

        let span = device_span("Kitchen", "3145C70123456789");
        assert_eq!(span.in_scope(|| 3), 3);
    }

    #[test]
    fn test_init_from_config_without_stdout() {
        let config = LoggingConfig {
            level: "trace".to_string(),
            stdout: false,
        };
        assert!(init_from_config(&config, true).is_ok());
    }
}
