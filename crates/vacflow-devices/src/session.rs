/*!
 * Shared robot sessions.
 *
 * A robot accepts a single client connection, so every component in the
 * process goes through one `SessionHolder`. Borrowing a session either attaches
 * to the live connection, joins the connection attempt already in flight, or
 * starts a new one. Each borrow is an RAII lease; when the last lease is
 * dropped the connection is ended.
 */
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vacflow_core::types::DeviceIdentity;
use vacflow_core::utils::format_duration;

use crate::cipher::{CipherNegotiator, CipherSuite, FailureClass};
use crate::error::{DeviceError, Result};
use crate::transport::{RawState, RobotTransport, TransportConnector, TransportEvent};

/// How long a connection attempt may take before it is abandoned
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives every state report of a connected session
pub trait StatusSink: Send + Sync + Debug {
    /// Take in a state report
    fn ingest(&self, state: &RawState);
}

/// A connected robot session
pub struct Session {
    id: Uuid,
    cipher: CipherSuite,
    transport: Arc<dyn RobotTransport>,
    forwarder: JoinHandle<()>,
    closed: AtomicBool,
}

impl Session {
    /// Session id, used to correlate log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The cipher suite the connection was negotiated with
    pub fn cipher(&self) -> &CipherSuite {
        &self.cipher
    }

    /// Whether the connection has been ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to the transport's events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    /// Start a cleaning mission over the whole map
    pub async fn clean(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.clean().await
    }

    /// Start a room mission
    pub async fn clean_room(&self, mission: &Value) -> Result<()> {
        self.ensure_open()?;
        self.transport.clean_room(mission).await
    }

    /// Pause the current mission
    pub async fn pause(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.pause().await
    }

    /// Resume a paused mission
    pub async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.resume().await
    }

    /// Send the robot home
    pub async fn dock(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.dock().await
    }

    /// Play the locate sound
    pub async fn find(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.find().await
    }

    /// Wait for the robot to report the given fields
    pub async fn get_robot_state(&self, fields: &[&str]) -> Result<RawState> {
        self.ensure_open()?;
        self.transport.get_robot_state(fields).await
    }

    /// End the connection; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.abort();
        self.transport.end();
        info!("Session {} closed", self.id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DeviceError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cipher", &self.cipher)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum Phase {
    Connecting(ConnectFuture),
    Live(Arc<Session>),
}

struct Attempt {
    generation: u64,
    borrowers: usize,
    phase: Phase,
}

/// Everything a connection attempt needs, independent of the holder's slot
#[derive(Debug)]
struct ConnectContext {
    identity: DeviceIdentity,
    connector: Arc<dyn TransportConnector>,
    negotiator: CipherNegotiator,
    sink: Arc<dyn StatusSink>,
    connect_timeout: Duration,
}

struct HolderShared {
    ctx: Arc<ConnectContext>,
    slot: Mutex<Option<Attempt>>,
    next_generation: AtomicU64,
}

impl HolderShared {
    fn slot(&self) -> MutexGuard<'_, Option<Attempt>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the outcome of the attempt with the given generation
    fn finish_attempt(&self, generation: u64, outcome: &Result<Arc<Session>>) {
        let mut slot = self.slot();
        let current = matches!(slot.as_ref(), Some(attempt) if attempt.generation == generation);

        let stale = match outcome {
            Ok(session) if current => {
                if let Some(attempt) = slot.as_mut() {
                    attempt.phase = Phase::Live(session.clone());
                }
                None
            }
            Ok(session) => Some(session.clone()),
            Err(_) if current => {
                slot.take();
                None
            }
            Err(_) => None,
        };
        drop(slot);

        if let Some(session) = stale {
            warn!("Session {} connected after its borrowers left; closing", session.id());
            session.close();
        }
    }

    /// Drop one borrower from the attempt with the given generation
    fn release(&self, generation: u64) {
        let mut slot = self.slot();
        let finished = match slot.as_mut() {
            Some(attempt) if attempt.generation == generation => {
                attempt.borrowers = attempt.borrowers.saturating_sub(1);
                debug!("Session released ({} borrowers left)", attempt.borrowers);
                attempt.borrowers == 0
            }
            _ => false,
        };
        let abandoned = if finished { slot.take() } else { None };
        drop(slot);

        match abandoned.map(|attempt| attempt.phase) {
            Some(Phase::Live(session)) => session.close(),
            Some(Phase::Connecting(_)) => {
                debug!("Connection attempt abandoned by all borrowers");
            }
            None => {}
        }
    }

    fn retain(&self, generation: u64) {
        let mut slot = self.slot();
        if let Some(attempt) = slot.as_mut() {
            if attempt.generation == generation {
                attempt.borrowers += 1;
            }
        }
    }
}

/// Builder for a session holder
#[derive(Debug)]
pub struct SessionHolderBuilder {
    identity: DeviceIdentity,
    connector: Arc<dyn TransportConnector>,
    sink: Arc<dyn StatusSink>,
    negotiator: Option<CipherNegotiator>,
    connect_timeout: Duration,
}

impl SessionHolderBuilder {
    /// Use a specific cipher negotiator
    pub fn with_negotiator(mut self, negotiator: CipherNegotiator) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Build the holder
    pub fn build(self) -> SessionHolder {
        let ctx = ConnectContext {
            identity: self.identity,
            connector: self.connector,
            negotiator: self.negotiator.unwrap_or_default(),
            sink: self.sink,
            connect_timeout: self.connect_timeout,
        };
        SessionHolder {
            shared: Arc::new(HolderShared {
                ctx: Arc::new(ctx),
                slot: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }
}

/// Owns the single session to one robot
#[derive(Clone)]
pub struct SessionHolder {
    shared: Arc<HolderShared>,
}

impl SessionHolder {
    /// Create a holder with the default cipher list and connect timeout
    pub fn new(
        identity: DeviceIdentity,
        connector: Arc<dyn TransportConnector>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self::builder(identity, connector, sink).build()
    }

    /// Start building a holder
    pub fn builder(
        identity: DeviceIdentity,
        connector: Arc<dyn TransportConnector>,
        sink: Arc<dyn StatusSink>,
    ) -> SessionHolderBuilder {
        SessionHolderBuilder {
            identity,
            connector,
            sink,
            negotiator: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// The robot this holder connects to
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.ctx.identity
    }

    /// The cipher negotiator shared by all attempts
    pub fn negotiator(&self) -> &CipherNegotiator {
        &self.shared.ctx.negotiator
    }

    /// Whether a session is currently connected
    pub fn is_connected(&self) -> bool {
        matches!(
            self.shared.slot().as_ref(),
            Some(Attempt { phase: Phase::Live(_), .. })
        )
    }

    /// Number of outstanding borrows, including those still waiting to connect
    pub fn borrowers(&self) -> usize {
        self.shared.slot().as_ref().map_or(0, |attempt| attempt.borrowers)
    }

    /// Borrow the session, connecting if needed
    ///
    /// Concurrent borrows share one connection attempt and all see its
    /// outcome.
    pub async fn borrow(&self) -> Result<SessionLease> {
        let (generation, connecting) = {
            let mut slot = self.shared.slot();
            match slot.as_mut() {
                Some(attempt) => {
                    attempt.borrowers += 1;
                    match &attempt.phase {
                        Phase::Live(session) => {
                            debug!(
                                "Reusing session {} ({} borrowers)",
                                session.id(),
                                attempt.borrowers
                            );
                            return Ok(SessionLease {
                                holder: self.shared.clone(),
                                generation: attempt.generation,
                                session: session.clone(),
                            });
                        }
                        Phase::Connecting(connecting) => (attempt.generation, connecting.clone()),
                    }
                }
                None => {
                    let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
                    let connecting = self.start_attempt(generation);
                    *slot = Some(Attempt {
                        generation,
                        borrowers: 1,
                        phase: Phase::Connecting(connecting.clone()),
                    });
                    (generation, connecting)
                }
            }
        };

        let pending = PendingBorrow {
            holder: self.shared.clone(),
            generation,
            armed: true,
        };
        let session = connecting.await?;
        if session.is_closed() {
            return Err(DeviceError::SessionClosed);
        }
        Ok(pending.into_lease(session))
    }

    /// Borrow the session for the duration of `f`
    pub async fn with_session<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(SessionLease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.borrow().await?;
        f(lease).await
    }

    fn start_attempt(&self, generation: u64) -> ConnectFuture {
        let ctx = self.shared.ctx.clone();
        let holder: Weak<HolderShared> = Arc::downgrade(&self.shared);
        async move {
            let outcome = ctx.connect_with_fallback().await;
            if let Some(holder) = holder.upgrade() {
                holder.finish_attempt(generation, &outcome);
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

impl Debug for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHolder")
            .field("identity", &self.shared.ctx.identity)
            .field("connected", &self.is_connected())
            .field("borrowers", &self.borrowers())
            .finish()
    }
}

/// A borrower's claim on an attempt that has not connected yet
struct PendingBorrow {
    holder: Arc<HolderShared>,
    generation: u64,
    armed: bool,
}

impl PendingBorrow {
    fn into_lease(mut self, session: Arc<Session>) -> SessionLease {
        self.armed = false;
        SessionLease {
            holder: self.holder.clone(),
            generation: self.generation,
            session,
        }
    }
}

impl Drop for PendingBorrow {
    fn drop(&mut self) {
        if self.armed {
            self.holder.release(self.generation);
        }
    }
}

/// A borrowed session; dropping it gives the borrow back
pub struct SessionLease {
    holder: Arc<HolderShared>,
    generation: u64,
    session: Arc<Session>,
}

impl SessionLease {
    /// The underlying shared session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Clone for SessionLease {
    fn clone(&self) -> Self {
        self.holder.retain(self.generation);
        Self {
            holder: self.holder.clone(),
            generation: self.generation,
            session: self.session.clone(),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.holder.release(self.generation);
    }
}

impl Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionLease").field(&self.session).finish()
    }
}

/// Ends a transport unless the attempt succeeded
struct EndOnDrop(Option<Arc<dyn RobotTransport>>);

impl EndOnDrop {
    fn disarm(mut self) -> Option<Arc<dyn RobotTransport>> {
        self.0.take()
    }
}

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        if let Some(transport) = self.0.take() {
            transport.end();
        }
    }
}

impl ConnectContext {
    /// Try each cipher suite at most once until one connects
    async fn connect_with_fallback(&self) -> Result<Arc<Session>> {
        let max_attempts = self.negotiator.suite_count();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cipher = self.negotiator.current().clone();
            info!(
                "Connecting to {} using {} (attempt {}/{})",
                self.identity, cipher, attempt, max_attempts
            );

            match self.connect_once(&cipher).await {
                Ok(session) => return Ok(session),
                Err(DeviceError::TransportRejected(message)) => {
                    let next = self.negotiator.advance();
                    if attempt >= max_attempts {
                        warn!(
                            "Connecting to {} failed with every cipher: {}",
                            self.identity, message
                        );
                        return Err(DeviceError::TransportRejected(message));
                    }
                    warn!(
                        "Connection to {} rejected ({}); retrying with {}",
                        self.identity, message, next
                    );
                }
                Err(e) => {
                    warn!("Connecting to {} failed: {}", self.identity, e);
                    return Err(e);
                }
            }
        }
    }

    async fn connect_once(&self, cipher: &CipherSuite) -> Result<Arc<Session>> {
        let transport = self.connector.open(&self.identity, cipher)?;
        let mut events = transport.subscribe();
        let guard = EndOnDrop(Some(transport.clone()));

        transport.connect();
        let outcome = match timeout(self.connect_timeout, self.wait_for_connect(&mut events)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeviceError::ConnectTimeout(self.connect_timeout)),
        };

        if let Err(e) = outcome {
            drop(guard);
            reap_late_connect(transport, events, self.connect_timeout);
            return Err(e);
        }

        let transport = guard.disarm().unwrap_or(transport);
        let id = Uuid::new_v4();
        let forwarder = tokio::spawn(forward_events(id, events, self.sink.clone()));
        info!(
            "Connected to {} using {} (session {})",
            self.identity, cipher, id
        );

        Ok(Arc::new(Session {
            id,
            cipher: cipher.clone(),
            transport,
            forwarder,
            closed: AtomicBool::new(false),
        }))
    }

    async fn wait_for_connect(&self, events: &mut broadcast::Receiver<TransportEvent>) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Connect) => return Ok(()),
                Ok(TransportEvent::Error(message)) => {
                    return Err(match self.negotiator.classify(&message) {
                        FailureClass::RetryWithNext => DeviceError::TransportRejected(message),
                        FailureClass::Fatal => DeviceError::TransportFatal(message),
                    });
                }
                Ok(TransportEvent::State(_)) => {
                    debug!("Ignoring state report received before connect");
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} transport events while connecting", skipped);
                }
                Err(RecvError::Closed) => {
                    return Err(DeviceError::TransportFatal(
                        "Event stream closed before connecting".to_string(),
                    ));
                }
            }
        }
    }
}

/// Feed every state report of a live session to the sink
async fn forward_events(
    session_id: Uuid,
    mut events: broadcast::Receiver<TransportEvent>,
    sink: Arc<dyn StatusSink>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::State(state)) => sink.ingest(&state),
            Ok(TransportEvent::Error(message)) => {
                warn!("Session {} transport error: {}", session_id, message);
            }
            Ok(TransportEvent::Connect) => {
                debug!("Session {} reconnected", session_id);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Session {} dropped {} state reports", session_id, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// End a failed attempt's transport again if it connects late
fn reap_late_connect(
    transport: Arc<dyn RobotTransport>,
    mut events: broadcast::Receiver<TransportEvent>,
    wait: Duration,
) {
    tokio::spawn(async move {
        let late = timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Connect) => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await;

        if let Ok(true) = late {
            warn!(
                "Transport connected after its attempt failed; ending it (waited up to {})",
                format_duration(wait)
            );
            transport.end();
        }
    });
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::protocols::simulated::{ConnectBehaviour, SimulatedConnector};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct RecordingSink(StdMutex<Vec<RawState>>);

    impl StatusSink for RecordingSink {
        fn ingest(&self, state: &RawState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("blid-1", "secret", "10.0.0.2")
    }

    fn holder(connector: &SimulatedConnector) -> (SessionHolder, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let holder = SessionHolder::new(identity(), Arc::new(connector.clone()), sink.clone());
        (holder, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_borrows_share_one_attempt() {
        let connector = SimulatedConnector::new();
        connector.script_connects([ConnectBehaviour::ConnectAfter(Duration::from_secs(2))]);
        let (holder, _) = holder(&connector);

        let (a, b, c) = tokio::join!(holder.borrow(), holder.borrow(), holder.borrow());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(connector.open_count(), 1);
        assert_eq!(a.id(), b.id());
        assert_eq!(b.id(), c.id());
        assert_eq!(holder.borrowers(), 3);
        assert!(holder.is_connected());

        drop(a);
        drop(b);
        assert!(holder.is_connected());
        drop(c);
        assert!(!holder.is_connected());
        assert_eq!(holder.borrowers(), 0);
        assert_eq!(connector.end_count(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_borrows_share_one_failure() {
        let connector = SimulatedConnector::new();
        connector.script_connects([ConnectBehaviour::Fail("ECONNREFUSED".into())]);
        let (holder, _) = holder(&connector);

        let (a, b) = tokio::join!(holder.borrow(), holder.borrow());
        assert_eq!(a.unwrap_err(), DeviceError::TransportFatal("ECONNREFUSED".into()));
        assert_eq!(b.unwrap_err(), DeviceError::TransportFatal("ECONNREFUSED".into()));
        assert_eq!(connector.open_count(), 1);
        assert_eq!(holder.borrowers(), 0);
        assert_eq!(holder.negotiator().current_index(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_cipher_fallback() {
        let connector = SimulatedConnector::new();
        connector.script_connects([
            ConnectBehaviour::Fail("TLS handshake failed".into()),
            ConnectBehaviour::Connect,
        ]);
        let (holder, _) = holder(&connector);

        let lease = holder.borrow().await.unwrap();
        assert_eq!(lease.cipher().name(), "TLS_AES_256_GCM_SHA384");
        assert_eq!(holder.negotiator().current_index(), 1);
        assert_eq!(
            connector.opened_ciphers(),
            vec!["AES128-SHA256".to_string(), "TLS_AES_256_GCM_SHA384".to_string()]
        );
        assert_eq!(connector.end_count(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_exhausted() {
        let connector = SimulatedConnector::new();
        connector.script_connects([
            ConnectBehaviour::Fail("TLS handshake failed".into()),
            ConnectBehaviour::Fail("Identifier rejected".into()),
        ]);
        let (holder, _) = holder(&connector);

        let err = holder.borrow().await.unwrap_err();
        assert_eq!(err, DeviceError::TransportRejected("Identifier rejected".into()));
        assert_eq!(connector.open_count(), 2);
        // Each rejection advanced the index once, wrapping back to the start.
        assert_eq!(holder.negotiator().current_index(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_connect_timeout_and_late_connect() {
        let connector = SimulatedConnector::new();
        connector.script_connects([ConnectBehaviour::ConnectAfter(Duration::from_secs(90))]);
        let (holder, _) = holder(&connector);

        let started = tokio::time::Instant::now();
        let err = holder.borrow().await.unwrap_err();
        assert_eq!(err, DeviceError::ConnectTimeout(CONNECT_TIMEOUT));
        assert!(started.elapsed() >= CONNECT_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(61));
        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.end_count(0), 1);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(connector.end_count(0), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_borrower_abandons_attempt() {
        let connector = SimulatedConnector::new();
        connector.script_connects([ConnectBehaviour::Hang]);
        let (holder, _) = holder(&connector);

        let outcome = timeout(Duration::from_secs(5), holder.borrow()).await;
        assert!(outcome.is_err());
        assert_eq!(holder.borrowers(), 0);
        assert_eq!(connector.end_count(0), 1);

        let lease = holder.borrow().await.unwrap();
        assert_eq!(connector.open_count(), 2);
        assert!(!lease.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_clone_and_with_session() {
        let connector = SimulatedConnector::new();
        let (holder, _) = holder(&connector);

        let lease = holder.borrow().await.unwrap();
        let copy = lease.clone();
        assert_eq!(holder.borrowers(), 2);
        drop(lease);
        assert!(holder.is_connected());

        let id = holder
            .with_session(|session| async move { Ok(session.id()) })
            .await
            .unwrap();
        assert_eq!(id, copy.id());
        assert_eq!(holder.borrowers(), 1);

        let session = copy.session().clone();
        drop(copy);
        assert!(session.is_closed());
        assert_eq!(session.pause().await, Err(DeviceError::SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_reports_reach_sink() {
        let connector = SimulatedConnector::new();
        let (holder, sink) = holder(&connector);

        let _lease = holder.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let reports = sink.0.lock().unwrap().len();
        assert!(reports >= 2, "expected periodic reports, got {}", reports);
    }
}
