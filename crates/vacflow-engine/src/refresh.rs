/*!
 * The state refresh protocol.
 *
 * The robot has no "give me everything" request that answers reliably, but it
 * streams state fragments while a client is connected. A refresh borrows the
 * session, folds the fragments it sees into one snapshot and stops at the
 * first complete one, or gives up after the status timeout.
 */
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, pin_mut, stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

use vacflow_core::logging::operation_span;
use vacflow_core::utils::{format_duration, with_timeout};
use vacflow_devices::{DeviceError, RawState, SessionHolder, TransportEvent};

use crate::cache::StatusCache;
use crate::error::{Error, Result};
use crate::snapshot::StatusSnapshot;

/// How long a refresh waits for a complete status
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(60);

/// Pulls a complete status from the robot into the cache
#[derive(Debug, Clone)]
pub struct StateRefresher {
    holder: SessionHolder,
    cache: Arc<StatusCache>,
    status_timeout: Duration,
    refreshes: Arc<AtomicUsize>,
}

impl StateRefresher {
    /// Create a refresher feeding the given cache
    pub fn new(holder: SessionHolder, cache: Arc<StatusCache>, status_timeout: Duration) -> Self {
        Self {
            holder,
            cache,
            status_timeout,
            refreshes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The cache refreshes are merged into
    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// The session holder refreshes borrow from
    pub fn holder(&self) -> &SessionHolder {
        &self.holder
    }

    /// Number of refreshes started so far
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Refresh the cache, reporting only whether it worked
    pub async fn refresh(&self) -> bool {
        match self.refresh_snapshot().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to refresh robot status: {}", e);
                false
            }
        }
    }

    /// Refresh the cache and return the merged snapshot
    pub async fn refresh_snapshot(&self) -> Result<StatusSnapshot> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.fold_into_cache()
            .instrument(operation_span("refresh", "refresher"))
            .await
    }

    async fn fold_into_cache(&self) -> Result<StatusSnapshot> {
        let started = Instant::now();

        let lease = self.holder.borrow().await?;
        let events = lease.subscribe();

        let complete = with_timeout(self.status_timeout, first_complete(events))
            .await
            .map_err(|_| {
                debug!(
                    "Timed out after {} waiting for a complete status",
                    format_duration(self.status_timeout)
                );
                Error::RefreshTimeout(self.status_timeout)
            })?;
        let snapshot = complete.ok_or(Error::Device(DeviceError::SessionClosed))?;

        let merged = self.cache.merge(&snapshot);
        debug!(
            "Refreshed robot status in {}: {}",
            format_duration(started.elapsed()),
            merged
        );
        Ok(merged)
    }
}

/// State fragments from a transport's event stream
fn state_reports(
    events: broadcast::Receiver<TransportEvent>,
) -> impl futures::Stream<Item = RawState> {
    stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::State(state)) => return Some((state, events)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Refresh missed {} state reports", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// The first complete snapshot folded from the stream, if the stream gets there
async fn first_complete(events: broadcast::Receiver<TransportEvent>) -> Option<StatusSnapshot> {
    let complete = state_reports(events)
        .scan(StatusSnapshot::new(), |seen, state| {
            *seen = seen.merge(&StatusSnapshot::from_raw(&state));
            future::ready(Some(seen.clone()))
        })
        .filter(|snapshot| future::ready(snapshot.is_complete()));
    pin_mut!(complete);
    complete.next().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vacflow_core::types::DeviceIdentity;
    use vacflow_devices::protocols::simulated::{ConnectBehaviour, SimulatedConnector};
    use vacflow_devices::state::BIN_FIELD;

    fn refresher(connector: &SimulatedConnector) -> StateRefresher {
        let cache = Arc::new(StatusCache::new(STATUS_TIMEOUT));
        let holder = SessionHolder::new(
            DeviceIdentity::new("blid", "pwd", "10.0.0.9"),
            Arc::new(connector.clone()),
            cache.clone(),
        );
        StateRefresher::new(holder, cache, STATUS_TIMEOUT)
    }

    #[tokio::test]
    async fn test_fold_stops_at_first_complete() {
        let (tx, rx) = broadcast::channel(16);
        for event in [
            json!({ "batPct": 50 }),
            json!({ "wifistat": { "wifi": 1 } }),
            json!({ "bin": { "full": true } }),
            json!({ "cleanMissionStatus": { "phase": "run" } }),
            json!({ "batPct": 49 }),
        ] {
            tx.send(TransportEvent::State(event.as_object().cloned().unwrap()))
                .unwrap();
        }

        let snapshot = first_complete(rx).await.unwrap();
        assert_eq!(snapshot.battery_level(), Some(50));
        assert_eq!(snapshot.bin_full(), Some(true));
        assert_eq!(snapshot.running(), Some(true));
    }

    #[tokio::test]
    async fn test_fold_ends_with_stream() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(TransportEvent::State(
            json!({ "batPct": 50 }).as_object().cloned().unwrap(),
        ))
        .unwrap();
        drop(tx);
        assert!(first_complete(rx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_merges_into_cache() {
        let connector = SimulatedConnector::new();
        connector.set_battery(42);
        let refresher = refresher(&connector);

        assert!(refresher.refresh().await);
        let cached = refresher.cache().snapshot();
        assert_eq!(cached.battery_level(), Some(42));
        assert_eq!(cached.charging(), Some(true));
        assert!(refresher.cache().is_fresh());
        assert_eq!(refresher.refresh_count(), 1);
        // The refresh's lease was the only borrower.
        assert!(!refresher.holder().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_stream_times_out() {
        let connector = SimulatedConnector::new();
        connector.remove_field(BIN_FIELD);
        let refresher = refresher(&connector);

        let started = Instant::now();
        let err = refresher.refresh_snapshot().await.unwrap_err();
        assert!(matches!(err, Error::RefreshTimeout(_)));
        assert!(started.elapsed() >= STATUS_TIMEOUT);
        assert!(started.elapsed() < STATUS_TIMEOUT + Duration::from_secs(1));
        assert!(!refresher.cache().is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_failure_is_reported_as_false() {
        let connector = SimulatedConnector::new();
        connector.script_connects([ConnectBehaviour::Fail("ECONNREFUSED".into())]);
        let refresher = refresher(&connector);

        assert!(!refresher.refresh().await);
        assert!(refresher.cache().snapshot().is_empty());
    }
}
