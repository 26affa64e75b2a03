/*!
 * Imperative robot commands.
 *
 * Starting, stopping and docking each depend on what the robot is doing at
 * the time, so every command here first looks at the cached or live status
 * and then picks the right transport call. Successful commands are followed
 * by a status refresh so hosts see the new state quickly.
 */
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vacflow_core::config::{CleanBehaviour, StopBehaviour};
use vacflow_core::utils::{format_duration, spawn_and_log};
use vacflow_devices::state::{self, LAST_COMMAND_FIELD, MISSION_STATUS_FIELD};
use vacflow_devices::{MissionPhase, SessionHolder, SessionLease};

use crate::cache::StatusCache;
use crate::error::{Error, Result};
use crate::poller::PollScheduler;

/// How often the phase is checked while waiting to send a paused robot home
pub const DOCK_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Behaviour settings for the command sequencer
#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// What `start` cleans
    pub clean_behaviour: CleanBehaviour,
    /// Room mission used when cleaning rooms
    pub mission: Option<Value>,
    /// What `stop` does with a running robot
    pub stop_behaviour: StopBehaviour,
    /// Phase polling cadence while waiting to dock
    pub dock_poll_interval: Duration,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            clean_behaviour: CleanBehaviour::default(),
            mission: None,
            stop_behaviour: StopBehaviour::default(),
            dock_poll_interval: DOCK_POLL_INTERVAL,
        }
    }
}

/// Turns user intents into robot commands
#[derive(Debug)]
pub struct CommandSequencer {
    holder: SessionHolder,
    cache: Arc<StatusCache>,
    poller: PollScheduler,
    settings: CommandSettings,
    dock_sequence: Mutex<Option<JoinHandle<()>>>,
}

impl CommandSequencer {
    /// Create a sequencer
    pub fn new(
        holder: SessionHolder,
        cache: Arc<StatusCache>,
        poller: PollScheduler,
        settings: CommandSettings,
    ) -> Self {
        Self {
            holder,
            cache,
            poller,
            settings,
            dock_sequence: Mutex::new(None),
        }
    }

    /// Start cleaning the way the settings say
    pub async fn start(&self) -> Result<()> {
        self.start_with_mode(self.settings.clean_behaviour).await
    }

    /// Start cleaning; a paused mission is resumed instead
    pub async fn start_with_mode(&self, mode: CleanBehaviour) -> Result<()> {
        info!("Starting robot");
        self.cancel_dock_sequence();
        let lease = self.holder.borrow().await?;

        let outcome = if self.cache.snapshot().paused() == Some(true) {
            debug!("Mission is paused; resuming");
            lease.resume().await
        } else {
            match mode {
                CleanBehaviour::Rooms => {
                    let mission = self.settings.mission.as_ref().ok_or_else(|| {
                        Error::configuration("Cleaning rooms needs a configured mission")
                    })?;
                    debug!("Cleaning configured rooms");
                    lease.clean_room(mission).await
                }
                CleanBehaviour::Everywhere => lease.clean().await,
            }
        };

        logged("start", outcome)?;
        debug!("Robot is running");
        self.poller.request_refresh_holding(lease);
        Ok(())
    }

    /// Stop the robot
    ///
    /// A running robot is paused and, with the `home` stop behaviour, sent to
    /// its dock once it has come to a halt. A robot heading home is paused.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping robot");
        self.cancel_dock_sequence();
        let lease = self.holder.borrow().await?;

        let status = logged("stop", lease.get_robot_state(&[MISSION_STATUS_FIELD]).await)?;
        let phase = state::mission_phase(&status).ok_or_else(|| {
            Error::invalid_state("Status report has no cleanMissionStatus.phase")
        })?;

        let outcome = match phase {
            MissionPhase::Run => {
                debug!("Robot is running; pausing");
                let paused = lease.pause().await;
                if paused.is_ok() {
                    match self.settings.stop_behaviour {
                        StopBehaviour::Home => {
                            debug!("Robot paused; returning to dock once stopped");
                            self.spawn_dock_sequence(lease.clone());
                        }
                        StopBehaviour::Pause => debug!("Robot is paused"),
                    }
                }
                paused
            }
            MissionPhase::HomePostMission => {
                debug!("Robot is docking; pausing");
                lease.pause().await
            }
            MissionPhase::Charge => {
                debug!("Robot is already docked");
                Ok(())
            }
            other => {
                debug!("Robot is not running ({})", other);
                Ok(())
            }
        };

        self.poller.request_refresh_holding(lease);
        logged("stop", outcome).map_err(Error::from)
    }

    /// Send the robot home, or pause it on its way there
    pub async fn set_docking(&self, docking: bool) -> Result<()> {
        debug!("Setting docking state to {}", docking);
        self.cancel_dock_sequence();
        let lease = self.holder.borrow().await?;

        if docking {
            logged("dock", lease.dock().await)?;
            debug!("Robot is docking");
        } else {
            logged("pause", lease.pause().await)?;
            debug!("Robot is paused");
        }
        self.poller.request_refresh_holding(lease);
        Ok(())
    }

    /// Make the robot play its locate sound
    pub async fn locate(&self) -> Result<()> {
        info!("Locating robot");
        let lease = self.holder.borrow().await?;
        logged("locate", lease.find().await)?;
        Ok(())
    }

    /// The mission the robot was last given
    ///
    /// A room mission copied from here can go straight into the `mission`
    /// setting.
    pub async fn last_command(&self) -> Result<Value> {
        let lease = self.holder.borrow().await?;
        let status = logged(
            "read last command",
            lease.get_robot_state(&[LAST_COMMAND_FIELD]).await,
        )?;
        state::last_command(&status)
            .cloned()
            .ok_or_else(|| Error::invalid_state("Robot did not report lastCommand"))
    }

    /// Whether a dock-when-stopped sequence is still running
    pub fn is_docking_pending(&self) -> bool {
        self.dock_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Abort any dock-when-stopped sequence
    pub fn cancel_dock_sequence(&self) {
        let previous = self
            .dock_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = previous {
            if !task.is_finished() {
                debug!("Cancelling pending dock sequence");
                task.abort();
            }
        }
    }

    fn spawn_dock_sequence(&self, lease: SessionLease) {
        let task = spawn_and_log(
            "dock-when-stopped",
            dock_when_stopped(lease, self.poller.clone(), self.settings.dock_poll_interval),
        );
        let previous = self
            .dock_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for CommandSequencer {
    fn drop(&mut self) {
        self.cancel_dock_sequence();
    }
}

/// Wait for a paused robot to come to a stop, then send it home
async fn dock_when_stopped(
    lease: SessionLease,
    poller: PollScheduler,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        let status = lease.get_robot_state(&[MISSION_STATUS_FIELD]).await?;
        match state::mission_phase(&status) {
            Some(MissionPhase::Stop) => {
                info!("Robot has stopped; sending it to the dock");
                logged("dock", lease.dock().await)?;
                poller.request_refresh_holding(lease);
                return Ok(());
            }
            Some(MissionPhase::Run) => {
                debug!(
                    "Robot is still running; checking again in {}",
                    format_duration(poll_interval)
                );
                tokio::time::sleep(poll_interval).await;
            }
            other => {
                debug!("Robot is in unexpected phase {:?}; not docking", other);
                return Ok(());
            }
        }
    }
}

fn logged<T>(
    command: &str,
    outcome: vacflow_devices::Result<T>,
) -> vacflow_devices::Result<T> {
    if let Err(e) = &outcome {
        warn!("Robot failed to {}: {}", command, e);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{PollPurpose, PollToken};
    use crate::refresh::{StateRefresher, STATUS_TIMEOUT};
    use serde_json::json;
    use vacflow_core::types::DeviceIdentity;
    use vacflow_devices::protocols::simulated::{RobotCommand, SimulatedConnector};
    use tokio_test::{assert_err, assert_ok};
    use vacflow_devices::DeviceError;

    fn sequencer(connector: &SimulatedConnector, settings: CommandSettings) -> CommandSequencer {
        sequencer_and_refresher(connector, settings).0
    }

    fn sequencer_and_refresher(
        connector: &SimulatedConnector,
        settings: CommandSettings,
    ) -> (CommandSequencer, StateRefresher) {
        let cache = Arc::new(StatusCache::new(STATUS_TIMEOUT));
        let holder = SessionHolder::new(
            DeviceIdentity::new("blid", "pwd", "10.0.0.9"),
            Arc::new(connector.clone()),
            cache.clone(),
        );
        let refresher = StateRefresher::new(holder.clone(), cache.clone(), STATUS_TIMEOUT);
        let poller = PollScheduler::spawn(refresher.clone(), Duration::from_secs(15 * 60));
        (CommandSequencer::new(holder, cache, poller, settings), refresher)
    }

    /// Wait until the refresh queued after a command has re-armed the timer
    async fn follow_up_refresh(commands: &CommandSequencer) -> PollToken {
        let mut armed = commands.poller.watch_armed();
        loop {
            if let Some(token) = *armed.borrow_and_update() {
                return token;
            }
            armed.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cleans_everywhere() {
        let connector = SimulatedConnector::new();
        let commands = sequencer(&connector, CommandSettings::default());

        commands.start().await.unwrap();
        assert_eq!(connector.commands(), vec![RobotCommand::Clean]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rooms_uses_mission() {
        let connector = SimulatedConnector::new();
        let mission = json!({ "pmap_id": "map-1", "regions": [{ "region_id": "5" }] });
        let commands = sequencer(
            &connector,
            CommandSettings {
                clean_behaviour: CleanBehaviour::Rooms,
                mission: Some(mission.clone()),
                ..CommandSettings::default()
            },
        );

        commands.start().await.unwrap();
        assert_eq!(connector.commands(), vec![RobotCommand::CleanRoom(mission)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rooms_without_mission() {
        let connector = SimulatedConnector::new();
        let commands = sequencer(&connector, CommandSettings::default());

        let err = commands.start_with_mode(CleanBehaviour::Rooms).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(connector.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resumes_paused_mission() {
        let connector = SimulatedConnector::new();
        let commands = sequencer(&connector, CommandSettings::default());
        commands
            .cache
            .merge(&crate::snapshot::StatusSnapshot::from_phase(MissionPhase::Pause));

        commands.start().await.unwrap();
        assert_eq!(connector.commands(), vec![RobotCommand::Resume]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_charging_is_a_no_op() {
        let connector = SimulatedConnector::new();
        let (commands, refresher) = sequencer_and_refresher(&connector, CommandSettings::default());

        commands.stop().await.unwrap();
        assert!(connector.commands().is_empty());
        assert!(!commands.is_docking_pending());

        let token = follow_up_refresh(&commands).await;
        assert_eq!(token.purpose, PollPurpose::Scheduled);
        assert_eq!(refresher.refresh_count(), 1);
        assert_eq!(refresher.cache().snapshot().charging(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_refreshes_after_failed_pause() {
        let connector = SimulatedConnector::new();
        connector.set_phase(MissionPhase::Run);
        connector.fail_command("pause", "robot busy");
        let (commands, refresher) = sequencer_and_refresher(&connector, CommandSettings::default());

        let err = assert_err!(commands.stop().await);
        assert!(matches!(
            err,
            Error::Device(DeviceError::CommandFailed { .. })
        ));
        assert!(!commands.is_docking_pending());

        let token = follow_up_refresh(&commands).await;
        assert_eq!(token.purpose, PollPurpose::Scheduled);
        assert_eq!(refresher.refresh_count(), 1);
        assert_eq!(refresher.cache().snapshot().running(), Some(true));
        // The session stayed up from the stop through its refresh.
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_pause_behaviour_does_not_dock() {
        let connector = SimulatedConnector::new();
        connector.set_phase(MissionPhase::Run);
        let (commands, refresher) = sequencer_and_refresher(
            &connector,
            CommandSettings {
                stop_behaviour: StopBehaviour::Pause,
                ..CommandSettings::default()
            },
        );

        commands.stop().await.unwrap();
        let token = follow_up_refresh(&commands).await;
        assert_eq!(token.purpose, PollPurpose::Scheduled);
        assert_eq!(refresher.refresh_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.commands(), vec![RobotCommand::Pause]);
        assert_eq!(
            refresher.cache().snapshot().mission_phase(),
            Some(&MissionPhase::Stop)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_heading_home_pauses() {
        let connector = SimulatedConnector::new();
        connector.set_phase(MissionPhase::HomePostMission);
        let (commands, refresher) = sequencer_and_refresher(&connector, CommandSettings::default());

        commands.stop().await.unwrap();
        let token = follow_up_refresh(&commands).await;
        assert_eq!(token.purpose, PollPurpose::Scheduled);
        assert_eq!(refresher.refresh_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.commands(), vec![RobotCommand::Pause]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dock_sequence_gives_up_on_unexpected_phase() {
        let connector = SimulatedConnector::new();
        connector.set_phase(MissionPhase::Run);
        connector.script_phases([MissionPhase::Run, MissionPhase::Stuck]);
        let commands = sequencer(&connector, CommandSettings::default());

        commands.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.commands(), vec![RobotCommand::Pause]);
        assert!(!commands.is_docking_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cancels_dock_sequence() {
        let connector = SimulatedConnector::new();
        connector.set_phase(MissionPhase::Run);
        connector.script_phases([MissionPhase::Run, MissionPhase::Run, MissionPhase::Run]);
        let commands = sequencer(&connector, CommandSettings::default());

        commands.stop().await.unwrap();
        assert!(commands.is_docking_pending());
        commands.start().await.unwrap();
        assert!(!commands.is_docking_pending());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!connector.commands().contains(&RobotCommand::Dock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_docking() {
        let connector = SimulatedConnector::new();
        let commands = sequencer(&connector, CommandSettings::default());

        assert_ok!(commands.set_docking(true).await);
        assert_ok!(commands.set_docking(false).await);
        assert_eq!(
            connector.commands(),
            vec![RobotCommand::Dock, RobotCommand::Pause]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_failure_propagates() {
        let connector = SimulatedConnector::new();
        connector.fail_command("find", "speaker unavailable");
        let commands = sequencer(&connector, CommandSettings::default());

        let err = assert_err!(commands.locate().await);
        assert!(matches!(
            err,
            Error::Device(DeviceError::CommandFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_command() {
        let connector = SimulatedConnector::new();
        let commands = sequencer(&connector, CommandSettings::default());

        let last = commands.last_command().await.unwrap();
        assert_eq!(last["pmap_id"], json!("map-1"));
        assert_eq!(last["regions"][0]["region_id"], json!("5"));
    }
}
