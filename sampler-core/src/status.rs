//! Point-in-time controller status for host surfaces.

use crate::hardware::SensorFrame;
use crate::procedure::{SequencerKind, StateName};
use crate::time::{Millis, Timestamp};
use crate::valves::ValveStatus;
use crate::MAX_VALVES;

/// Snapshot of the controller, cheap to copy out for rendering.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub now: Timestamp,
    pub uptime: Millis,
    /// Active procedure, if one is running.
    pub procedure: Option<(SequencerKind, StateName)>,
    /// Valve driven by the running procedure.
    pub current_valve: Option<u8>,
    /// Task armed or operating right now.
    pub current_task: Option<u32>,
    /// Readings from the most recent control tick.
    pub sensors: SensorFrame,
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub valve_statuses: [ValveStatus; MAX_VALVES],
    /// `false` while a run is pending or in flight.
    pub shutdown_allowed: bool,
    pub max_pressure: f32,
}

impl StatusSnapshot {
    /// Number of valves still free for assignment.
    #[must_use]
    pub fn free_valves(&self) -> usize {
        self.valve_statuses
            .iter()
            .filter(|status| **status == ValveStatus::Free)
            .count()
    }

    /// Number of valves holding samples.
    #[must_use]
    pub fn sampled_valves(&self) -> usize {
        self.valve_statuses
            .iter()
            .filter(|status| **status == ValveStatus::Sampled)
            .count()
    }
}
