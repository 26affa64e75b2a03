/*!
 * Point-in-time robot status.
 *
 * A `StatusSnapshot` is built from state report fragments and merged by
 * overlaying: a field seen later replaces the earlier value, a field missing
 * from the newer snapshot keeps the older one.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

use vacflow_devices::state;
use vacflow_devices::{MissionPhase, RawState};

/// Battery percentage at or below which the battery counts as low
pub const LOW_BATTERY_THRESHOLD: u8 = 20;

/// What we know about the robot, field by field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    mission_phase: Option<MissionPhase>,
    running: Option<bool>,
    paused: Option<bool>,
    docking: Option<bool>,
    charging: Option<bool>,
    battery_level: Option<u8>,
    bin_full: Option<bool>,
}

impl StatusSnapshot {
    /// An empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract whatever a state report fragment tells us
    pub fn from_raw(raw: &RawState) -> Self {
        let mut snapshot = Self {
            battery_level: state::battery_level(raw),
            bin_full: state::bin_full(raw),
            ..Self::default()
        };
        if let Some(phase) = state::mission_phase(raw) {
            snapshot.set_phase(phase);
        }
        snapshot
    }

    /// A snapshot holding only a mission phase and what follows from it
    pub fn from_phase(phase: MissionPhase) -> Self {
        let mut snapshot = Self::default();
        snapshot.set_phase(phase);
        snapshot
    }

    fn set_phase(&mut self, phase: MissionPhase) {
        self.running = Some(phase == MissionPhase::Run);
        self.paused = Some(phase == MissionPhase::Pause);
        self.docking = Some(phase == MissionPhase::HomePostMission);
        self.charging = Some(phase == MissionPhase::Charge);
        self.mission_phase = Some(phase);
    }

    /// Overlay `newer` on top of this snapshot
    pub fn merge(&self, newer: &StatusSnapshot) -> StatusSnapshot {
        StatusSnapshot {
            mission_phase: newer
                .mission_phase
                .clone()
                .or_else(|| self.mission_phase.clone()),
            running: newer.running.or(self.running),
            paused: newer.paused.or(self.paused),
            docking: newer.docking.or(self.docking),
            charging: newer.charging.or(self.charging),
            battery_level: newer.battery_level.or(self.battery_level),
            bin_full: newer.bin_full.or(self.bin_full),
        }
    }

    /// Whether battery level, bin flag and mission phase have all been seen
    pub fn is_complete(&self) -> bool {
        self.battery_level.is_some() && self.bin_full.is_some() && self.mission_phase.is_some()
    }

    /// Whether nothing has been seen yet
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The mission phase the derived flags came from
    pub fn mission_phase(&self) -> Option<&MissionPhase> {
        self.mission_phase.as_ref()
    }

    /// Whether the robot is cleaning
    pub fn running(&self) -> Option<bool> {
        self.running
    }

    /// Whether the mission is paused
    pub fn paused(&self) -> Option<bool> {
        self.paused
    }

    /// Whether the robot is heading home after a mission
    pub fn docking(&self) -> Option<bool> {
        self.docking
    }

    /// Whether the robot is charging on its dock
    pub fn charging(&self) -> Option<bool> {
        self.charging
    }

    /// Battery percentage
    pub fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    /// Whether the battery is at or below the low threshold
    pub fn low_battery(&self) -> Option<bool> {
        self.battery_level.map(|level| level <= LOW_BATTERY_THRESHOLD)
    }

    /// Whether the bin is full
    pub fn bin_full(&self) -> Option<bool> {
        self.bin_full
    }
}

fn show<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "?".to_string(), |value| value.to_string())
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phase={} battery={}% bin_full={}",
            show(self.mission_phase.as_ref()),
            show(self.battery_level),
            show(self.bin_full)
        )
    }
}
