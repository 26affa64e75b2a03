/*!
 * Background status polling.
 *
 * A single actor task owns the poll timer. Requests to start polling, refresh
 * right away or stop arrive over a channel, so arming and cancelling the timer
 * never race. At most one timer (the current `PollToken`) is armed at a time.
 */
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

use vacflow_core::logging::component_span;
use vacflow_core::utils::format_duration;
use vacflow_devices::SessionLease;

use crate::error::{Error, Result};
use crate::refresh::StateRefresher;

/// Delay before retrying when the first poll fails
pub const INITIAL_POLL_RETRY: Duration = Duration::from_secs(10);

/// Why a poll timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPurpose {
    /// Polling has not managed a first refresh yet
    InitialRetry,
    /// Regular idle polling
    Scheduled,
}

/// The currently armed poll timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollToken {
    /// Increases every time a timer is armed
    pub id: u64,
    /// Why the timer was armed
    pub purpose: PollPurpose,
    /// Delay the timer was armed with
    pub interval: Duration,
}

impl fmt::Display for PollToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({:?}, {})",
            self.id,
            self.purpose,
            format_duration(self.interval)
        )
    }
}

enum PollRequest {
    Start,
    RefreshNow {
        reply: Option<oneshot::Sender<bool>>,
        lease: Option<SessionLease>,
    },
    Stop,
}

struct PollActor {
    refresher: StateRefresher,
    idle_interval: Duration,
    requests: mpsc::Receiver<PollRequest>,
    armed: Option<(PollToken, Instant)>,
    next_token: u64,
    started: bool,
    first_status: bool,
    published: watch::Sender<Option<PollToken>>,
}

impl PollActor {
    async fn run(mut self) {
        debug!("Poll scheduler running");
        loop {
            let deadline = self.armed.map(|(_, at)| at);
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(PollRequest::Start) => self.start().await,
                    Some(PollRequest::RefreshNow { reply, lease }) => {
                        let refreshed = self.refresh_for_user().await;
                        drop(lease);
                        if let Some(reply) = reply {
                            let _ = reply.send(refreshed);
                        }
                    }
                    Some(PollRequest::Stop) | None => break,
                },
                _ = wait_until(deadline) => {
                    if let Some((token, _)) = self.armed.take() {
                        self.fire(token).await;
                    }
                }
            }
        }
        self.disarm();
        debug!("Poll scheduler stopped");
    }

    async fn start(&mut self) {
        if self.started {
            debug!("Polling already started");
            return;
        }
        self.started = true;
        info!("Starting to poll robot status");
        self.initial_poll().await;
    }

    async fn initial_poll(&mut self) {
        if self.refresher.refresh().await {
            self.first_status = true;
            debug!("Initial status obtained; polling every {}", format_duration(self.idle_interval));
            self.arm(PollPurpose::Scheduled, self.idle_interval);
        } else {
            warn!(
                "Failed to obtain initial status; retrying in {}",
                format_duration(INITIAL_POLL_RETRY)
            );
            self.arm(PollPurpose::InitialRetry, INITIAL_POLL_RETRY);
        }
    }

    async fn fire(&mut self, token: PollToken) {
        debug!("Poll timer {} fired", token);
        match token.purpose {
            PollPurpose::InitialRetry => self.initial_poll().await,
            PollPurpose::Scheduled => {
                self.refresh_for_user().await;
            }
        }
    }

    /// Cancel the armed timer, refresh now and re-arm the idle timer
    ///
    /// Until polling has obtained its first status, a failure keeps the short
    /// initial retry armed instead.
    async fn refresh_for_user(&mut self) -> bool {
        debug!("Fetching updated status");
        self.disarm();
        let refreshed = self.refresher.refresh().await;
        if refreshed {
            self.first_status = true;
            debug!("Status updated; next update in {}", format_duration(self.idle_interval));
        } else if self.started && !self.first_status {
            warn!(
                "Still no initial status; retrying in {}",
                format_duration(INITIAL_POLL_RETRY)
            );
            self.arm(PollPurpose::InitialRetry, INITIAL_POLL_RETRY);
            return false;
        } else {
            debug!(
                "Failed to update status; trying again in {}",
                format_duration(self.idle_interval)
            );
        }
        self.arm(PollPurpose::Scheduled, self.idle_interval);
        refreshed
    }

    fn arm(&mut self, purpose: PollPurpose, interval: Duration) {
        let deadline = match Instant::now().checked_add(interval) {
            Some(deadline) => deadline,
            None => {
                warn!("Poll interval {} is too long; not polling", format_duration(interval));
                return;
            }
        };
        self.next_token += 1;
        let token = PollToken {
            id: self.next_token,
            purpose,
            interval,
        };
        self.armed = Some((token, deadline));
        self.refresher.cache().observe_poll_interval(interval);
        self.published.send_replace(Some(token));
    }

    fn disarm(&mut self) {
        if let Some((token, _)) = self.armed.take() {
            debug!("Cancelled poll timer {}", token);
        }
        self.published.send_replace(None);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Handle to the poll actor
#[derive(Debug, Clone)]
pub struct PollScheduler {
    requests: mpsc::Sender<PollRequest>,
    armed: watch::Receiver<Option<PollToken>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for PollRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollRequest::Start => f.write_str("Start"),
            PollRequest::RefreshNow { reply, lease } => f
                .debug_struct("RefreshNow")
                .field("awaited", &reply.is_some())
                .field("holding_session", &lease.is_some())
                .finish(),
            PollRequest::Stop => f.write_str("Stop"),
        }
    }
}

impl PollScheduler {
    /// Spawn the poll actor; nothing is polled until `start_polling`
    pub fn spawn(refresher: StateRefresher, idle_interval: Duration) -> Self {
        let (requests, receiver) = mpsc::channel(16);
        let (published, armed) = watch::channel(None);
        let span = component_span("poller", Some(&refresher.holder().identity().local_id));
        let actor = PollActor {
            refresher,
            idle_interval,
            requests: receiver,
            armed: None,
            next_token: 0,
            started: false,
            first_status: false,
            published,
        };
        let task = tokio::spawn(actor.run().instrument(span));
        Self {
            requests,
            armed,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Take a first status and keep polling from then on
    pub async fn start_polling(&self) -> Result<()> {
        self.requests
            .send(PollRequest::Start)
            .await
            .map_err(|_| Error::SchedulerStopped)
    }

    /// Refresh right away and restart the idle timer; returns whether the
    /// refresh worked
    pub async fn refresh_status_for_user(&self) -> Result<bool> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(PollRequest::RefreshNow {
                reply: Some(reply),
                lease: None,
            })
            .await
            .map_err(|_| Error::SchedulerStopped)?;
        outcome.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Ask for a refresh without waiting for it
    pub fn request_refresh(&self) {
        self.enqueue_refresh(None);
    }

    /// Ask for a refresh, keeping the session open until it is done
    pub fn request_refresh_holding(&self, lease: SessionLease) {
        self.enqueue_refresh(Some(lease));
    }

    fn enqueue_refresh(&self, lease: Option<SessionLease>) {
        let request = PollRequest::RefreshNow { reply: None, lease };
        if let Err(e) = self.requests.try_send(request) {
            warn!("Could not queue status refresh: {}", e);
        }
    }

    /// The timer currently armed, if any
    pub fn armed(&self) -> Option<PollToken> {
        *self.armed.borrow()
    }

    /// Watch the armed timer change
    pub fn watch_armed(&self) -> watch::Receiver<Option<PollToken>> {
        self.armed.clone()
    }

    /// Cancel the timer and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.requests.send(PollRequest::Stop).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Poll scheduler task ended abnormally: {}", e);
            }
        }
        info!("Stopped polling robot status");
    }
}
