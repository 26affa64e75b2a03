/*!
 * Vocabulary of the robot's state reports.
 *
 * The robot reports a nested JSON document. This module knows where the
 * fields we care about live in it, and what the mission phases mean.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::RawState;

/// Top-level report holding the mission phase
pub const MISSION_STATUS_FIELD: &str = "cleanMissionStatus";
/// Top-level report holding the battery percentage
pub const BATTERY_FIELD: &str = "batPct";
/// Top-level report holding the bin status
pub const BIN_FIELD: &str = "bin";
/// Top-level report holding the last mission the robot was given
pub const LAST_COMMAND_FIELD: &str = "lastCommand";

/// The phase of the robot's current mission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MissionPhase {
    /// Docked and charging
    Charge,
    /// Cleaning
    Run,
    /// Stopped somewhere on the floor
    Stop,
    /// Paused mid-mission
    Pause,
    /// Returning to the dock after a mission
    HomePostMission,
    /// Returning to the dock on user request
    HomeUserDock,
    /// Returning to the dock to recharge mid-mission
    HomeMidMission,
    /// Emptying the bin at the dock
    Evacuating,
    /// Stuck and waiting for help
    Stuck,
    /// A phase this client does not model
    Other(String),
}

impl MissionPhase {
    /// The phase as the robot spells it
    pub fn as_str(&self) -> &str {
        match self {
            MissionPhase::Charge => "charge",
            MissionPhase::Run => "run",
            MissionPhase::Stop => "stop",
            MissionPhase::Pause => "pause",
            MissionPhase::HomePostMission => "hmPostMsn",
            MissionPhase::HomeUserDock => "hmUsrDock",
            MissionPhase::HomeMidMission => "hmMidMsn",
            MissionPhase::Evacuating => "evac",
            MissionPhase::Stuck => "stuck",
            MissionPhase::Other(other) => other,
        }
    }
}

impl FromStr for MissionPhase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "charge" => MissionPhase::Charge,
            "run" => MissionPhase::Run,
            "stop" => MissionPhase::Stop,
            "pause" => MissionPhase::Pause,
            "hmPostMsn" => MissionPhase::HomePostMission,
            "hmUsrDock" => MissionPhase::HomeUserDock,
            "hmMidMsn" => MissionPhase::HomeMidMission,
            "evac" => MissionPhase::Evacuating,
            "stuck" => MissionPhase::Stuck,
            other => MissionPhase::Other(other.to_string()),
        })
    }
}

impl From<String> for MissionPhase {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(phase) => phase,
            Err(never) => match never {},
        }
    }
}

impl From<MissionPhase> for String {
    fn from(phase: MissionPhase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mission phase in a report, if the report carries one
pub fn mission_phase(state: &RawState) -> Option<MissionPhase> {
    state
        .get(MISSION_STATUS_FIELD)?
        .get("phase")?
        .as_str()
        .map(|phase| MissionPhase::from(phase.to_string()))
}

/// The battery percentage in a report, clamped to 0..=100
pub fn battery_level(state: &RawState) -> Option<u8> {
    let pct = state.get(BATTERY_FIELD)?.as_f64()?;
    Some(pct.round().clamp(0.0, 100.0) as u8)
}

/// The bin-full flag in a report
pub fn bin_full(state: &RawState) -> Option<bool> {
    state.get(BIN_FIELD)?.get("full")?.as_bool()
}

/// The last mission the robot was given, if reported
pub fn last_command(state: &RawState) -> Option<&Value> {
    state.get(LAST_COMMAND_FIELD)
}
