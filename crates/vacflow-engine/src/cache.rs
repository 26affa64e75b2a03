/*!
 * The cached robot status and the reads served from it.
 *
 * Every state report the session receives is merged into one snapshot. The
 * snapshot counts as fresh for the last armed poll interval plus two status
 * timeouts; reads outside that window trigger a refresh first.
 */
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use vacflow_core::utils::format_duration;
use vacflow_devices::{RawState, StatusSink};

use crate::refresh::StateRefresher;
use crate::snapshot::StatusSnapshot;

#[derive(Debug)]
struct CacheEntry {
    snapshot: StatusSnapshot,
    refreshed_at: Option<Instant>,
    refreshed_at_utc: Option<DateTime<Utc>>,
    poll_interval: Duration,
}

/// The merged status of one robot
#[derive(Debug)]
pub struct StatusCache {
    entry: RwLock<CacheEntry>,
    status_timeout: Duration,
    updates: watch::Sender<StatusSnapshot>,
}

impl StatusCache {
    /// Create an empty cache; `status_timeout` widens the freshness window
    pub fn new(status_timeout: Duration) -> Self {
        let (updates, _) = watch::channel(StatusSnapshot::new());
        Self {
            entry: RwLock::new(CacheEntry {
                snapshot: StatusSnapshot::new(),
                refreshed_at: None,
                refreshed_at_utc: None,
                poll_interval: Duration::ZERO,
            }),
            status_timeout,
            updates,
        }
    }

    fn read_entry(&self) -> RwLockReadGuard<'_, CacheEntry> {
        self.entry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entry(&self) -> RwLockWriteGuard<'_, CacheEntry> {
        self.entry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overlay `update` on the cached snapshot and return the result
    ///
    /// The refresh timestamp only moves once the merged snapshot is complete.
    pub fn merge(&self, update: &StatusSnapshot) -> StatusSnapshot {
        let merged = {
            let mut entry = self.write_entry();
            entry.snapshot = entry.snapshot.merge(update);
            if entry.snapshot.is_complete() {
                entry.refreshed_at = Some(Instant::now());
                entry.refreshed_at_utc = Some(Utc::now());
            }
            entry.snapshot.clone()
        };

        self.updates.send_if_modified(|current| {
            if *current == merged {
                false
            } else {
                *current = merged.clone();
                true
            }
        });
        trace!("Merged status: {}", merged);
        merged
    }

    /// The cached snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        self.read_entry().snapshot.clone()
    }

    /// Record the interval of the poll timer that was just armed
    pub fn observe_poll_interval(&self, interval: Duration) {
        self.write_entry().poll_interval = interval;
    }

    /// The interval of the most recently armed poll timer
    pub fn poll_interval(&self) -> Duration {
        self.read_entry().poll_interval
    }

    /// How old the snapshot may get before reads refresh it
    pub fn max_age(&self) -> Duration {
        self.poll_interval() + self.status_timeout * 2
    }

    /// Whether a complete snapshot was merged within `max_age`
    pub fn is_fresh(&self) -> bool {
        let entry = self.read_entry();
        let max_age = entry.poll_interval + self.status_timeout * 2;
        entry
            .refreshed_at
            .map_or(false, |at| at.elapsed() < max_age)
    }

    /// Time since the snapshot was last complete and updated
    pub fn age(&self) -> Option<Duration> {
        self.read_entry().refreshed_at.map(|at| at.elapsed())
    }

    /// Wall-clock time of the last complete update
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.read_entry().refreshed_at_utc
    }

    /// Watch the snapshot change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.updates.subscribe()
    }
}

impl StatusSink for StatusCache {
    fn ingest(&self, state: &RawState) {
        let update = StatusSnapshot::from_raw(state);
        // Reports about wifi, schedules and the like carry nothing we track.
        if !update.is_empty() {
            self.merge(&update);
        }
    }
}

/// A status field could not be produced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No value for {0}")]
pub struct NoValue(pub String);

/// Serves named status fields, refreshing the cache when it is stale
#[derive(Debug, Clone)]
pub struct StatusReader {
    refresher: StateRefresher,
}

impl StatusReader {
    /// Create a reader over the refresher's cache
    pub fn new(refresher: StateRefresher) -> Self {
        Self { refresher }
    }

    /// Read one field of the status
    ///
    /// A stale cache is refreshed first. Fails with `NoValue` if that refresh
    /// fails or the field has not been reported.
    pub async fn read<T, F>(&self, name: &str, extractor: F) -> Result<T, NoValue>
    where
        F: Fn(&StatusSnapshot) -> Option<T>,
    {
        let cache = self.refresher.cache();
        if cache.is_fresh() {
            debug!("Reading {} from cached status", name);
        } else {
            debug!(
                "Cached status is stale (max age {}); refreshing before reading {}",
                format_duration(cache.max_age()),
                name
            );
            if !self.refresher.refresh().await {
                warn!("Could not read {}: status refresh failed", name);
                return Err(NoValue(name.to_string()));
            }
        }

        extractor(&cache.snapshot()).ok_or_else(|| {
            debug!("Status has no value for {}", name);
            NoValue(name.to_string())
        })
    }
}
