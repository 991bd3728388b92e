//! Sampling valve status tracking.
//!
//! Each of the instrument's offshoot valves carries a single status code.
//! The codes mirror the values written to durable storage, so the numeric
//! mapping here is part of the on-disk format and must not be reordered.

use core::fmt;

use heapless::String;

use crate::MAX_VALVES;

/// Maximum length of a valve group label.
pub const GROUP_CAPACITY: usize = 16;

/// Status of a single sampling valve.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ValveStatus {
    /// Physically absent or decommissioned; never schedulable.
    Unavailable,
    /// Holds a collected sample; must not be reopened.
    Sampled,
    /// Available for assignment to a task.
    #[default]
    Free,
    /// Currently being driven by an in-flight procedure.
    Operating,
    /// Reserved by the next task due to run.
    Next,
    /// Its task's schedule passed without the procedure running.
    Missed,
}

impl ValveStatus {
    /// Persistent status code. `Unavailable` is `-1` for compatibility with
    /// existing deployment records.
    #[must_use]
    pub const fn code(self) -> i8 {
        match self {
            ValveStatus::Unavailable => -1,
            ValveStatus::Sampled => 0,
            ValveStatus::Free => 1,
            ValveStatus::Operating => 2,
            ValveStatus::Next => 3,
            ValveStatus::Missed => 4,
        }
    }

    /// Decodes a persisted status code.
    #[must_use]
    pub const fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(ValveStatus::Unavailable),
            0 => Some(ValveStatus::Sampled),
            1 => Some(ValveStatus::Free),
            2 => Some(ValveStatus::Operating),
            3 => Some(ValveStatus::Next),
            4 => Some(ValveStatus::Missed),
            _ => None,
        }
    }

    /// Whether a task may claim this valve when it is scheduled.
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        matches!(self, ValveStatus::Free | ValveStatus::Missed)
    }
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValveStatus::Unavailable => "unavailable",
            ValveStatus::Sampled => "sampled",
            ValveStatus::Free => "free",
            ValveStatus::Operating => "operating",
            ValveStatus::Next => "next",
            ValveStatus::Missed => "missed",
        };
        f.write_str(text)
    }
}

/// Fixed bank of valve statuses indexed by valve number.
///
/// Valve numbers are validated at the console and task boundaries, so an
/// out-of-range index here is a programming error and panics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValveBank {
    statuses: [ValveStatus; MAX_VALVES],
    /// Optional deployment label per valve, e.g. a site or depth group.
    groups: [String<GROUP_CAPACITY>; MAX_VALVES],
}

impl ValveBank {
    /// Creates a bank with every valve free.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            statuses: [ValveStatus::Free; MAX_VALVES],
            groups: [const { String::new() }; MAX_VALVES],
        }
    }

    /// Restores a bank from persisted statuses.
    #[must_use]
    pub const fn from_statuses(statuses: [ValveStatus; MAX_VALVES]) -> Self {
        Self {
            statuses,
            groups: [const { String::new() }; MAX_VALVES],
        }
    }

    #[must_use]
    pub fn status(&self, valve: u8) -> ValveStatus {
        self.statuses[usize::from(valve)]
    }

    pub fn set_status(&mut self, valve: u8, status: ValveStatus) {
        self.statuses[usize::from(valve)] = status;
    }

    /// Frees the valve unless it already holds a sample. Used when a task is
    /// cancelled or misses its schedule: a collected sample is never
    /// discarded by bookkeeping.
    pub fn free_if_not_sampled(&mut self, valve: u8) {
        let slot = &mut self.statuses[usize::from(valve)];
        if *slot != ValveStatus::Sampled {
            *slot = ValveStatus::Free;
        }
    }

    /// Returns the lowest-numbered free valve, if any.
    #[must_use]
    pub fn first_free(&self) -> Option<u8> {
        self.statuses
            .iter()
            .position(|status| *status == ValveStatus::Free)
            .and_then(|index| u8::try_from(index).ok())
    }

    /// Returns `true` when the valve number addresses a real slot.
    #[must_use]
    pub fn contains(&self, valve: u8) -> bool {
        usize::from(valve) < MAX_VALVES
    }

    #[must_use]
    pub fn group(&self, valve: u8) -> &str {
        &self.groups[usize::from(valve)]
    }

    /// Labels a valve with a deployment group, truncated to fit.
    pub fn set_group(&mut self, valve: u8, group: &str) {
        let slot = &mut self.groups[usize::from(valve)];
        slot.clear();
        for ch in group.chars() {
            if slot.push(ch).is_err() {
                break;
            }
        }
    }

    /// Number of valves currently reserved or driven by a run.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.statuses
            .iter()
            .filter(|status| {
                matches!(status, ValveStatus::Operating | ValveStatus::Next)
            })
            .count()
    }

    #[must_use]
    pub const fn statuses(&self) -> &[ValveStatus; MAX_VALVES] {
        &self.statuses
    }
}

impl Default for ValveBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            ValveStatus::Unavailable,
            ValveStatus::Sampled,
            ValveStatus::Free,
            ValveStatus::Operating,
            ValveStatus::Next,
            ValveStatus::Missed,
        ] {
            assert_eq!(ValveStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(ValveStatus::from_code(9), None);
    }

    #[test]
    fn armed_and_running_valves_are_not_schedulable() {
        assert!(ValveStatus::Free.is_schedulable());
        assert!(ValveStatus::Missed.is_schedulable());
        assert!(!ValveStatus::Next.is_schedulable());
        assert!(!ValveStatus::Operating.is_schedulable());
        assert!(!ValveStatus::Sampled.is_schedulable());
        assert!(!ValveStatus::Unavailable.is_schedulable());
    }

    #[test]
    fn sampled_valve_is_never_freed_by_bookkeeping() {
        let mut bank = ValveBank::new();
        bank.set_status(3, ValveStatus::Sampled);
        bank.set_status(4, ValveStatus::Operating);

        bank.free_if_not_sampled(3);
        bank.free_if_not_sampled(4);

        assert_eq!(bank.status(3), ValveStatus::Sampled);
        assert_eq!(bank.status(4), ValveStatus::Free);
    }

    #[test]
    fn groups_are_labels_only() {
        let mut bank = ValveBank::new();
        bank.set_group(2, "inlet-deep");
        bank.set_group(3, "a-label-that-is-far-too-long-to-keep");

        assert_eq!(bank.group(2), "inlet-deep");
        assert_eq!(bank.group(3).len(), GROUP_CAPACITY);
        assert_eq!(bank.status(2), ValveStatus::Free);
    }

    #[test]
    fn in_use_counts_reserved_and_running() {
        let mut bank = ValveBank::new();
        bank.set_status(0, ValveStatus::Operating);
        bank.set_status(1, ValveStatus::Next);
        bank.set_status(2, ValveStatus::Sampled);
        assert_eq!(bank.in_use(), 2);
    }

    #[test]
    fn first_free_skips_claimed_valves() {
        let mut bank = ValveBank::new();
        bank.set_status(0, ValveStatus::Sampled);
        bank.set_status(1, ValveStatus::Unavailable);
        assert_eq!(bank.first_free(), Some(2));
    }
}
