/*!
 * Simulated robot transport.
 *
 * An in-process stand-in for the encrypted pub/sub client. The connector is
 * scripted with connect outcomes, the robot model with mission phases and
 * command failures, and everything the client does is recorded so tests and
 * demos can inspect it afterwards.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use vacflow_core::types::DeviceIdentity;

use crate::cipher::CipherSuite;
use crate::error::{DeviceError, Result};
use crate::state::{MissionPhase, BATTERY_FIELD, BIN_FIELD, MISSION_STATUS_FIELD};
use crate::transport::{RawState, RobotTransport, TransportConnector, TransportEvent};

/// How often a connected simulated robot reports its state
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// How a simulated transport reacts to `connect`
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehaviour {
    /// Connect immediately
    Connect,
    /// Report the given error instead of connecting
    Fail(String),
    /// Never report anything
    Hang,
    /// Connect after a delay, even if the transport was ended meanwhile
    ConnectAfter(Duration),
}

/// A command received by the simulated robot
#[derive(Debug, Clone, PartialEq)]
pub enum RobotCommand {
    /// Clean everywhere
    Clean,
    /// Clean the given mission
    CleanRoom(Value),
    /// Pause
    Pause,
    /// Resume
    Resume,
    /// Return to the dock
    Dock,
    /// Play the locate sound
    Find,
}

impl RobotCommand {
    /// The command name, as used for failure injection
    pub fn name(&self) -> &'static str {
        match self {
            RobotCommand::Clean => "clean",
            RobotCommand::CleanRoom(_) => "cleanRoom",
            RobotCommand::Pause => "pause",
            RobotCommand::Resume => "resume",
            RobotCommand::Dock => "dock",
            RobotCommand::Find => "find",
        }
    }
}

/// A command together with the (tokio) time it was received
#[derive(Debug, Clone)]
pub struct CommandRecord {
    /// The command
    pub command: RobotCommand,
    /// When it was received
    pub at: Instant,
}

#[derive(Debug)]
struct RobotModel {
    reported: RawState,
    phase_script: VecDeque<MissionPhase>,
    commands: Vec<CommandRecord>,
    failures: HashMap<String, String>,
    state_queries: usize,
}

impl RobotModel {
    fn new() -> Self {
        let reported = json!({
            "cleanMissionStatus": { "cycle": "none", "phase": "charge" },
            "batPct": 100,
            "bin": { "present": true, "full": false },
            "lastCommand": {
                "command": "start",
                "initiator": "localApp",
                "pmap_id": "map-1",
                "regions": [{ "region_id": "5", "type": "rid" }],
                "user_pmapv_id": "map-1-v3",
            },
        });
        Self {
            reported: reported.as_object().cloned().unwrap_or_default(),
            phase_script: VecDeque::new(),
            commands: Vec::new(),
            failures: HashMap::new(),
            state_queries: 0,
        }
    }

    fn set_phase(&mut self, phase: &MissionPhase) {
        let status = self
            .reported
            .entry(MISSION_STATUS_FIELD)
            .or_insert_with(|| json!({ "cycle": "none" }));
        if !status.is_object() {
            *status = json!({ "cycle": "none" });
        }
        if let Some(status) = status.as_object_mut() {
            status.insert("phase".to_string(), Value::String(phase.to_string()));
        }
    }

    /// Each top-level field goes out as its own fragment, like the real robot
    fn fragments(&self) -> Vec<RawState> {
        self.reported
            .iter()
            .map(|(key, value)| {
                let mut fragment = RawState::new();
                fragment.insert(key.clone(), value.clone());
                fragment
            })
            .collect()
    }
}

struct ConnectorInner {
    script: Mutex<VecDeque<ConnectBehaviour>>,
    opened: Mutex<Vec<Arc<SimulatedTransport>>>,
    robot: Arc<Mutex<RobotModel>>,
    report_interval: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens simulated transports against one shared robot model
#[derive(Clone)]
pub struct SimulatedConnector {
    inner: Arc<ConnectorInner>,
}

impl SimulatedConnector {
    /// Create a connector whose robot is docked, charged and has an empty bin
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                script: Mutex::new(VecDeque::new()),
                opened: Mutex::new(Vec::new()),
                robot: Arc::new(Mutex::new(RobotModel::new())),
                report_interval: Mutex::new(DEFAULT_REPORT_INTERVAL),
            }),
        }
    }

    /// Queue connect outcomes for the next transports; once the queue is empty
    /// transports connect immediately
    pub fn script_connects<I: IntoIterator<Item = ConnectBehaviour>>(&self, behaviours: I) {
        lock(&self.inner.script).extend(behaviours);
    }

    /// Queue phases returned by successive `get_robot_state` calls
    pub fn script_phases<I: IntoIterator<Item = MissionPhase>>(&self, phases: I) {
        lock(&self.inner.robot).phase_script.extend(phases);
    }

    /// Change how often connected transports report state
    pub fn set_report_interval(&self, interval: Duration) {
        *lock(&self.inner.report_interval) = interval;
    }

    /// Set the reported mission phase
    pub fn set_phase(&self, phase: MissionPhase) {
        lock(&self.inner.robot).set_phase(&phase);
    }

    /// Set the reported battery percentage
    pub fn set_battery(&self, pct: u8) {
        lock(&self.inner.robot)
            .reported
            .insert(BATTERY_FIELD.to_string(), json!(pct));
    }

    /// Set the reported bin-full flag
    pub fn set_bin_full(&self, full: bool) {
        lock(&self.inner.robot)
            .reported
            .insert(BIN_FIELD.to_string(), json!({ "present": true, "full": full }));
    }

    /// Stop reporting a top-level field
    pub fn remove_field(&self, field: &str) {
        lock(&self.inner.robot).reported.remove(field);
    }

    /// Make every future call of the named command fail
    pub fn fail_command<C: Into<String>, M: Into<String>>(&self, command: C, message: M) {
        lock(&self.inner.robot)
            .failures
            .insert(command.into(), message.into());
    }

    /// Number of transports opened so far
    pub fn open_count(&self) -> usize {
        lock(&self.inner.opened).len()
    }

    /// Cipher of every transport opened, in order
    pub fn opened_ciphers(&self) -> Vec<String> {
        lock(&self.inner.opened)
            .iter()
            .map(|transport| transport.cipher.name().to_string())
            .collect()
    }

    /// How many times the transport with the given index was ended
    pub fn end_count(&self, index: usize) -> usize {
        lock(&self.inner.opened)
            .get(index)
            .map_or(0, |transport| transport.end_count.load(Ordering::SeqCst))
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<RobotCommand> {
        lock(&self.inner.robot)
            .commands
            .iter()
            .map(|record| record.command.clone())
            .collect()
    }

    /// Commands received so far, with their arrival times
    pub fn command_log(&self) -> Vec<CommandRecord> {
        lock(&self.inner.robot).commands.clone()
    }

    /// Number of `get_robot_state` calls so far
    pub fn state_query_count(&self) -> usize {
        lock(&self.inner.robot).state_queries
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedConnector")
            .field("opened", &self.open_count())
            .finish()
    }
}

impl TransportConnector for SimulatedConnector {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open(
        &self,
        identity: &DeviceIdentity,
        cipher: &CipherSuite,
    ) -> Result<Arc<dyn RobotTransport>> {
        let behaviour = lock(&self.inner.script)
            .pop_front()
            .unwrap_or(ConnectBehaviour::Connect);
        let report_interval = *lock(&self.inner.report_interval);
        debug!(
            "Opening simulated transport to {} with {} ({:?})",
            identity, cipher, behaviour
        );

        let (events, _) = broadcast::channel(64);
        let transport = Arc::new_cyclic(|me| SimulatedTransport {
            me: me.clone(),
            cipher: cipher.clone(),
            behaviour,
            events,
            robot: self.inner.robot.clone(),
            report_interval,
            connected: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            end_count: AtomicUsize::new(0),
        });
        lock(&self.inner.opened).push(transport.clone());
        Ok(transport)
    }
}

/// One simulated connection
pub struct SimulatedTransport {
    me: Weak<SimulatedTransport>,
    cipher: CipherSuite,
    behaviour: ConnectBehaviour,
    events: broadcast::Sender<TransportEvent>,
    robot: Arc<Mutex<RobotModel>>,
    report_interval: Duration,
    connected: AtomicBool,
    ended: AtomicBool,
    end_count: AtomicUsize,
}

impl SimulatedTransport {
    fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn report(&self) {
        let fragments = lock(&self.robot).fragments();
        for fragment in fragments {
            self.emit(TransportEvent::State(fragment));
        }
    }

    fn establish(&self) {
        self.emit(TransportEvent::Connect);
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.report();

        let me = self.me.clone();
        let interval = self.report_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match me.upgrade() {
                    Some(transport) if !transport.ended.load(Ordering::SeqCst) => {
                        transport.report()
                    }
                    _ => break,
                }
            }
        });
    }

    fn execute(&self, command: RobotCommand) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::SessionClosed);
        }

        {
            let mut robot = lock(&self.robot);
            robot.commands.push(CommandRecord {
                command: command.clone(),
                at: Instant::now(),
            });
            if let Some(message) = robot.failures.get(command.name()) {
                return Err(DeviceError::command_failed(command.name(), message));
            }
            let phase = match &command {
                RobotCommand::Clean | RobotCommand::CleanRoom(_) | RobotCommand::Resume => {
                    Some(MissionPhase::Run)
                }
                RobotCommand::Pause => Some(MissionPhase::Stop),
                RobotCommand::Dock => Some(MissionPhase::HomeUserDock),
                RobotCommand::Find => None,
            };
            if let Some(phase) = phase {
                robot.set_phase(&phase);
            }
        }

        info!("Simulated robot received {}", command.name());
        self.report();
        Ok(())
    }
}

impl fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("cipher", &self.cipher)
            .field("behaviour", &self.behaviour)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("ended", &self.ended.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl RobotTransport for SimulatedTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn connect(&self) {
        match &self.behaviour {
            ConnectBehaviour::Connect => self.establish(),
            ConnectBehaviour::Fail(message) => self.emit(TransportEvent::Error(message.clone())),
            ConnectBehaviour::Hang => {}
            ConnectBehaviour::ConnectAfter(delay) => {
                let me = self.me.clone();
                let delay = *delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(transport) = me.upgrade() {
                        transport.establish();
                    }
                });
            }
        }
    }

    fn end(&self) {
        self.end_count.fetch_add(1, Ordering::SeqCst);
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            debug!("Simulated transport ({}) ended", self.cipher);
        }
    }

    async fn clean(&self) -> Result<()> {
        self.execute(RobotCommand::Clean)
    }

    async fn clean_room(&self, mission: &Value) -> Result<()> {
        self.execute(RobotCommand::CleanRoom(mission.clone()))
    }

    async fn pause(&self) -> Result<()> {
        self.execute(RobotCommand::Pause)
    }

    async fn resume(&self) -> Result<()> {
        self.execute(RobotCommand::Resume)
    }

    async fn dock(&self) -> Result<()> {
        self.execute(RobotCommand::Dock)
    }

    async fn find(&self) -> Result<()> {
        self.execute(RobotCommand::Find)
    }

    async fn get_robot_state(&self, fields: &[&str]) -> Result<RawState> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(DeviceError::SessionClosed);
        }

        let mut robot = lock(&self.robot);
        robot.state_queries += 1;
        if let Some(phase) = robot.phase_script.pop_front() {
            robot.set_phase(&phase);
        }
        Ok(fields
            .iter()
            .filter_map(|field| {
                robot
                    .reported
                    .get(*field)
                    .map(|value| (field.to_string(), value.clone()))
            })
            .collect())
    }
}
