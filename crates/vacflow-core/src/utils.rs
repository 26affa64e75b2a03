/*!
 * Utility functions and helpers for vacflow.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Returns
///
/// The output of the future, or a timeout error naming how long we waited
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {}",
            format_duration(duration)
        ))),
    }
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Render a duration the way the logs show it: `850ms`, `12.5s`, `15m`
pub fn format_duration(duration: Duration) -> String {
    let millis = duration_to_millis(duration);
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{}s", round_tenths(millis as f64 / 1_000.0))
    } else {
        format!("{}m", round_tenths(millis as f64 / 60_000.0))
    }
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Convert a Duration to milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_secs(15 * 60)), "15m");
        assert_eq!(format_duration(Duration::from_secs(150)), "2.5m");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let fast = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(fast.unwrap(), 7);

        let slow = with_timeout(Duration::from_secs(60), std::future::pending::<()>()).await;
        match slow {
            Err(Error::Timeout(msg)) => assert!(msg.contains("60s")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_duration_to_millis() {
        assert_eq!(duration_to_millis(Duration::from_millis(1234)), 1234);
    }

    #[tokio::test]
    async fn test_spawn_and_log_runs_future() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let handle = spawn_and_log("probe", async move {
            flag.store(true, Ordering::SeqCst);
            Err::<(), _>("expected failure")
        });
        handle.await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
