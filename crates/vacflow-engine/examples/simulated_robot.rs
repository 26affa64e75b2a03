//! Drive a simulated robot through a short cleaning session.
//!
//! Configuration is read from `vacflow.toml` if present and from `VACFLOW__*`
//! environment variables; missing credentials are filled with placeholders
//! since the simulated robot accepts anything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use vacflow_core::config::{ConfigBuilder, SharedConfig};
use vacflow_core::logging;
use vacflow_devices::protocols::simulated::{ConnectBehaviour, SimulatedConnector};
use vacflow_devices::MissionPhase;
use vacflow_engine::{ClientSettings, RobotClient, StatusSnapshot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ConfigBuilder::new()
        .with_config_file("vacflow.toml")
        .with_environment_prefix("VACFLOW")
        .build()
        .context("loading configuration")?;
    logging::init_from_config(&config.logging, config.general.debug)?;

    if config.robot.blid.is_empty() {
        config.robot.blid = "SIMULATED0001".to_string();
        config.robot.robotpwd = "simulated".to_string();
        config.robot.ipaddress = "127.0.0.1".to_string();
    }
    let config = SharedConfig::from(config);
    let settings = ClientSettings::from_config(config.get()).context("invalid configuration")?;

    // The first cipher is rejected, like on newer firmware.
    let connector = SimulatedConnector::new();
    connector.script_connects([ConnectBehaviour::Fail("TLS handshake failed".into())]);
    connector.set_battery(64);

    let client = RobotClient::new(settings, Arc::new(connector.clone()));
    client.start_polling().await?;

    let battery = client
        .read("battery", StatusSnapshot::battery_level)
        .await
        .context("reading battery")?;
    println!("Battery at {}%", battery);

    client.start().await?;
    println!("Cleaning: {:?}", client.read("running", StatusSnapshot::running).await);

    // The robot keeps rolling for a moment after the pause.
    connector.script_phases([MissionPhase::Run, MissionPhase::Run, MissionPhase::Stop]);
    client.stop().await?;
    tokio::time::sleep(Duration::from_secs(10)).await;

    println!("Last mission: {}", client.last_command().await?);
    println!("Commands sent: {:?}", connector.commands());
    println!("Status: {}", client.snapshot());

    client.shutdown().await;
    Ok(())
}
