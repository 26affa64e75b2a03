/*!
 * Configuration management for vacflow.
 *
 * This module provides functionality to load, validate, and access the
 * settings of one robot client: the robot's credentials, how it should clean
 * and stop, how often it is polled, and which optional sensors the host shows.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::DeviceIdentity;

/// Longest accepted background poll interval, in minutes (one week)
pub const MAX_IDLE_WATCH_INTERVAL: u64 = 7 * 24 * 60;

/// Core configuration for vacflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Robot identity and description
    #[serde(default)]
    pub robot: RobotConfig,

    /// Cleaning, stopping and polling behaviour
    #[serde(default)]
    pub behaviour: BehaviourConfig,

    /// Optional sensors exposed by the host
    #[serde(default)]
    pub accessories: AccessoryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Verbose logging of the connection lifecycle
    #[serde(default)]
    pub debug: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,
}

/// Robot identity and description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Display name
    #[serde(default = "default_robot_name")]
    pub name: String,

    /// Model name, informational
    #[serde(default)]
    pub model: String,

    /// Serial number, informational
    #[serde(default)]
    pub serialnum: String,

    /// Local robot identifier
    #[serde(default)]
    pub blid: String,

    /// Robot pairing password
    #[serde(default)]
    pub robotpwd: String,

    /// Robot address on the local network
    #[serde(default)]
    pub ipaddress: String,
}

/// What "start" does when the robot is not paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanBehaviour {
    /// Run the configured room mission
    Rooms,
    /// Clean the whole map
    #[default]
    #[serde(other)]
    Everywhere,
}

/// What "stop" does while the robot is cleaning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBehaviour {
    /// Pause, wait for the robot to stop, then send it to the dock
    #[default]
    Home,
    /// Pause and leave the robot where it is
    #[serde(other)]
    Pause,
}

/// Cleaning, stopping and polling behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourConfig {
    /// What "start" does
    #[serde(default)]
    pub clean_behaviour: CleanBehaviour,

    /// Room mission as JSON text, as reported in the robot's `lastCommand`
    #[serde(default)]
    pub mission: Option<String>,

    /// What "stop" does
    #[serde(default)]
    pub stop_behaviour: StopBehaviour,

    /// Minutes between background polls
    #[serde(default = "default_idle_watch_interval")]
    pub idle_watch_interval: u64,
}

/// Optional sensors exposed by the host
///
/// The client does not interpret these, it only carries them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryConfig {
    /// Show "docked" as a contact sensor
    #[serde(default = "default_true")]
    pub dock_contact_sensor: bool,

    /// Show "running" as a contact sensor
    #[serde(default)]
    pub running_contact_sensor: bool,

    /// Show "bin full" as a contact sensor
    #[serde(default)]
    pub bin_contact_sensor: bool,

    /// Show "docking" as a contact sensor
    #[serde(default)]
    pub docking_contact_sensor: bool,

    /// Show a "return home" switch
    #[serde(default)]
    pub home_switch: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            debug: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_true(),
        }
    }
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            name: default_robot_name(),
            model: String::new(),
            serialnum: String::new(),
            blid: String::new(),
            robotpwd: String::new(),
            ipaddress: String::new(),
        }
    }
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            clean_behaviour: CleanBehaviour::default(),
            mission: None,
            stop_behaviour: StopBehaviour::default(),
            idle_watch_interval: default_idle_watch_interval(),
        }
    }
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            dock_contact_sensor: true,
            running_contact_sensor: false,
            bin_contact_sensor: false,
            docking_contact_sensor: false,
            home_switch: false,
        }
    }
}

fn default_app_name() -> String {
    "vacflow".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_robot_name() -> String {
    "Roomba".to_string()
}

fn default_idle_watch_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl RobotConfig {
    /// The identity used to open connections
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.blid, &self.robotpwd, &self.ipaddress)
    }
}

impl BehaviourConfig {
    /// Interval between background polls
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_watch_interval.saturating_mul(60))
    }

    /// Parse the configured room mission
    pub fn mission_json(&self) -> Result<Option<serde_json::Value>> {
        match self.mission.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => serde_json::from_str(text)
                .map(Some)
                .map_err(|e| Error::config(format!("Invalid mission: {}", e))),
        }
    }
}

impl Config {
    /// Check that the configuration describes a reachable robot
    pub fn validate(&self) -> Result<()> {
        if self.robot.blid.trim().is_empty() {
            return Err(Error::config("robot.blid is required"));
        }
        if self.robot.robotpwd.is_empty() {
            return Err(Error::config("robot.robotpwd is required"));
        }
        if self.robot.ipaddress.trim().is_empty() {
            return Err(Error::config("robot.ipaddress is required"));
        }
        if self.behaviour.idle_watch_interval == 0 {
            return Err(Error::config(
                "behaviour.idle_watch_interval must be at least one minute",
            ));
        }
        if self.behaviour.idle_watch_interval > MAX_IDLE_WATCH_INTERVAL {
            return Err(Error::config(format!(
                "behaviour.idle_watch_interval must be at most {} minutes",
                MAX_IDLE_WATCH_INTERVAL
            )));
        }
        if self.behaviour.clean_behaviour == CleanBehaviour::Rooms
            && self.behaviour.mission_json()?.is_none()
        {
            return Err(Error::config(
                "behaviour.mission is required when clean_behaviour is \"rooms\"",
            ));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    ///
    /// The robot password is written as-is, so treat the output like the
    /// original file.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder.build()?.try_deserialize()?;

        info!("Configuration loaded for robot {}", config.robot.name);
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.robot.blid = "3145C70123456789".to_string();
        config.robot.robotpwd = ":1:1234567890:abcdefgh".to_string();
        config.robot.ipaddress = "192.168.1.40".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "vacflow");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.behaviour.clean_behaviour, CleanBehaviour::Everywhere);
        assert_eq!(config.behaviour.stop_behaviour, StopBehaviour::Home);
        assert_eq!(
            config.behaviour.idle_poll_interval(),
            Duration::from_secs(15 * 60)
        );
        assert!(config.accessories.dock_contact_sensor);
        assert!(!config.accessories.home_switch);
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "vacflow");
        assert_eq!(config.robot.name, "Roomba");
        assert!(config.behaviour.mission.is_none());
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("robot.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                debug = true

                [robot]
                name = "Downstairs"
                blid = "3145C70123456789"
                robotpwd = "secret"
                ipaddress = "10.0.0.7"

                [behaviour]
                clean_behaviour = "rooms"
                mission = '{"pmap_id": "abc", "regions": [{"region_id": "3"}]}'
                stop_behaviour = "pause"
                idle_watch_interval = 5
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert!(config.general.debug);
        assert_eq!(config.robot.name, "Downstairs");
        assert_eq!(config.robot.identity().address, "10.0.0.7");
        assert_eq!(config.behaviour.clean_behaviour, CleanBehaviour::Rooms);
        assert_eq!(config.behaviour.stop_behaviour, StopBehaviour::Pause);
        assert_eq!(config.behaviour.idle_poll_interval(), Duration::from_secs(300));
        let mission = config.behaviour.mission_json()?.unwrap();
        assert_eq!(mission["pmap_id"], "abc");
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_unknown_behaviours_fall_back() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("robot.toml");
        std::fs::write(
            &file_path,
            "[behaviour]\nclean_behaviour = \"whole-house\"\nstop_behaviour = \"stay\"\n",
        )?;

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;
        assert_eq!(config.behaviour.clean_behaviour, CleanBehaviour::Everywhere);
        assert_eq!(config.behaviour.stop_behaviour, StopBehaviour::Pause);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("VACFLOWTEST__ROBOT__NAME", "env-robot");
        env::set_var("VACFLOWTEST__BEHAVIOUR__IDLE_WATCH_INTERVAL", "30");

        let config = ConfigBuilder::new()
            .with_environment_prefix("vacflowtest")
            .build()?;

        assert_eq!(config.robot.name, "env-robot");
        assert_eq!(config.behaviour.idle_watch_interval, 30);

        env::remove_var("VACFLOWTEST__ROBOT__NAME");
        env::remove_var("VACFLOWTEST__BEHAVIOUR__IDLE_WATCH_INTERVAL");

        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.robot.blid.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = valid_config();
        config.behaviour.idle_watch_interval = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.behaviour.clean_behaviour = CleanBehaviour::Rooms;
        assert!(config.validate().is_err());

        config.behaviour.mission = Some("{not json".to_string());
        assert!(config.validate().is_err());

        config.behaviour.mission = Some(r#"{"regions": []}"#.to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_idle_interval() {
        let mut config = valid_config();
        config.behaviour.idle_watch_interval = u64::MAX / 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(
            config.behaviour.idle_poll_interval(),
            Duration::from_secs(u64::MAX)
        );

        config.behaviour.idle_watch_interval = MAX_IDLE_WATCH_INTERVAL;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.behaviour.idle_poll_interval(),
            Duration::from_secs(7 * 24 * 3600)
        );
    }

    #[test]
    fn test_to_toml() -> Result<()> {
        let rendered = valid_config().to_toml()?;
        assert!(rendered.contains("blid = \"3145C70123456789\""));
        assert!(rendered.contains("clean_behaviour = \"everywhere\""));
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(valid_config());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().robot.ipaddress, "192.168.1.40");
        assert_eq!(shared.as_ref().robot.name, "Roomba");
    }
}
