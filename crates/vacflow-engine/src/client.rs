/*!
 * The robot client.
 *
 * `RobotClient` wires one robot's session holder, status cache, refresher,
 * reader, poll scheduler and command sequencer together. Hosts build one per
 * configured robot and talk to it through the methods here.
 */
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, Instrument, Span};

use vacflow_core::config::{CleanBehaviour, Config, StopBehaviour};
use vacflow_core::logging::device_span;
use vacflow_core::types::DeviceIdentity;
use vacflow_core::utils::format_duration;
use vacflow_devices::{CipherNegotiator, SessionHolder, TransportConnector, CONNECT_TIMEOUT};

use crate::cache::{NoValue, StatusCache, StatusReader};
use crate::commands::{CommandSequencer, CommandSettings, DOCK_POLL_INTERVAL};
use crate::error::Result;
use crate::poller::PollScheduler;
use crate::refresh::{StateRefresher, STATUS_TIMEOUT};
use crate::snapshot::StatusSnapshot;

/// Everything a client needs to know about its robot
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Display name of the robot
    pub name: String,
    /// Robot identity and address
    pub identity: DeviceIdentity,
    /// What `start` cleans
    pub clean_behaviour: CleanBehaviour,
    /// Room mission for `rooms` cleaning
    pub mission: Option<Value>,
    /// What `stop` does with a running robot
    pub stop_behaviour: StopBehaviour,
    /// Time between background polls
    pub idle_poll_interval: Duration,
    /// Connect timeout per cipher attempt
    pub connect_timeout: Duration,
    /// How long a refresh waits for a complete status
    pub status_timeout: Duration,
    /// Phase polling cadence while waiting to dock
    pub dock_poll_interval: Duration,
}

impl ClientSettings {
    /// Settings for the given robot with default behaviour
    pub fn new<S: Into<String>>(name: S, identity: DeviceIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            clean_behaviour: CleanBehaviour::default(),
            mission: None,
            stop_behaviour: StopBehaviour::default(),
            idle_poll_interval: Duration::from_secs(15 * 60),
            connect_timeout: CONNECT_TIMEOUT,
            status_timeout: STATUS_TIMEOUT,
            dock_poll_interval: DOCK_POLL_INTERVAL,
        }
    }

    /// Settings from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clean_behaviour: config.behaviour.clean_behaviour,
            mission: config.behaviour.mission_json()?,
            stop_behaviour: config.behaviour.stop_behaviour,
            idle_poll_interval: config.behaviour.idle_poll_interval(),
            ..Self::new(config.robot.name.clone(), config.robot.identity())
        })
    }

    fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            clean_behaviour: self.clean_behaviour,
            mission: self.mission.clone(),
            stop_behaviour: self.stop_behaviour,
            dock_poll_interval: self.dock_poll_interval,
        }
    }
}

/// A client for one robot
#[derive(Debug)]
pub struct RobotClient {
    settings: ClientSettings,
    holder: SessionHolder,
    cache: Arc<StatusCache>,
    refresher: StateRefresher,
    reader: StatusReader,
    poller: PollScheduler,
    commands: CommandSequencer,
    span: Span,
}

impl RobotClient {
    /// Create a client using the default cipher list
    ///
    /// Must be called inside a tokio runtime. No connection is made until
    /// something needs one.
    pub fn new(settings: ClientSettings, connector: Arc<dyn TransportConnector>) -> Self {
        Self::with_negotiator(settings, connector, CipherNegotiator::default())
    }

    /// Create a client with a specific cipher negotiator
    pub fn with_negotiator(
        settings: ClientSettings,
        connector: Arc<dyn TransportConnector>,
        negotiator: CipherNegotiator,
    ) -> Self {
        let cache = Arc::new(StatusCache::new(settings.status_timeout));
        let holder = SessionHolder::builder(settings.identity.clone(), connector, cache.clone())
            .with_negotiator(negotiator)
            .with_connect_timeout(settings.connect_timeout)
            .build();
        let refresher = StateRefresher::new(holder.clone(), cache.clone(), settings.status_timeout);
        let reader = StatusReader::new(refresher.clone());
        let poller = PollScheduler::spawn(refresher.clone(), settings.idle_poll_interval);
        let commands = CommandSequencer::new(
            holder.clone(),
            cache.clone(),
            poller.clone(),
            settings.command_settings(),
        );

        let span = device_span(&settings.name, &settings.identity.local_id);
        info!(
            "Created client for {} ({}), polling every {}",
            settings.name,
            settings.identity,
            format_duration(settings.idle_poll_interval)
        );
        Self {
            settings,
            holder,
            cache,
            refresher,
            reader,
            poller,
            commands,
            span,
        }
    }

    /// The client's settings
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The session holder, for diagnostics
    pub fn holder(&self) -> &SessionHolder {
        &self.holder
    }

    /// The poll scheduler, for diagnostics
    pub fn poller(&self) -> &PollScheduler {
        &self.poller
    }

    /// The refresher, for diagnostics
    pub fn refresher(&self) -> &StateRefresher {
        &self.refresher
    }

    /// Take a first status and keep polling in the background
    pub async fn start_polling(&self) -> Result<()> {
        self.poller.start_polling().await
    }

    /// Read one status field, refreshing first if the cache is stale
    pub async fn read<T, F>(&self, name: &str, extractor: F) -> std::result::Result<T, NoValue>
    where
        F: Fn(&StatusSnapshot) -> Option<T>,
    {
        self.reader.read(name, extractor).await
    }

    /// Refresh now and restart the poll timer
    pub async fn refresh(&self) -> Result<bool> {
        self.poller.refresh_status_for_user().instrument(self.span.clone()).await
    }

    /// The cached status, however old
    pub fn snapshot(&self) -> StatusSnapshot {
        self.cache.snapshot()
    }

    /// Watch the cached status change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.cache.subscribe()
    }

    /// Start cleaning
    pub async fn start(&self) -> Result<()> {
        self.commands.start().instrument(self.span.clone()).await
    }

    /// Stop cleaning
    pub async fn stop(&self) -> Result<()> {
        self.commands.stop().instrument(self.span.clone()).await
    }

    /// Send the robot home (`true`) or pause it (`false`)
    pub async fn set_docking(&self, docking: bool) -> Result<()> {
        self.commands.set_docking(docking).instrument(self.span.clone()).await
    }

    /// Play the locate sound
    pub async fn locate(&self) -> Result<()> {
        self.commands.locate().instrument(self.span.clone()).await
    }

    /// The mission the robot was last given
    pub async fn last_command(&self) -> Result<Value> {
        self.commands.last_command().await
    }

    /// Stop polling and abandon any pending dock sequence
    pub async fn shutdown(&self) {
        self.commands.cancel_dock_sequence();
        self.poller.shutdown().await;
        info!("Client for {} shut down", self.settings.name);
    }
}
