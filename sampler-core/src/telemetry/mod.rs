//! Typed event log shared by the controller and host tooling.
//!
//! Every externally visible mutation (valve status change, task lifecycle
//! step, procedure state transition, scheduling decision) is appended to a
//! fixed-size ring buffer. Host surfaces render the records; nothing in the
//! core ever blocks on an observer. This replaces the token-keyed observer
//! lists the instrument firmware historically used.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::procedure::{ExitCause, SequenceError, SequencerKind, StateName};
use crate::tasks::TaskStatus;
use crate::time::{Millis, Timestamp};
use crate::valves::ValveStatus;

/// Identifier assigned to each recorded event, wrapping on overflow.
pub type EventId = u32;

/// Total number of event records retained in memory.
pub const EVENT_RING_CAPACITY: usize = 64;

/// Discriminated events recorded by the orchestration core.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EventKind {
    ValveStatusChanged { valve: u8, status: ValveStatus },
    TaskStatusChanged { task: u32, status: TaskStatus },
    TaskDeleted { task: u32 },
    MissedSchedule { task: u32 },
    AlarmArmed { at: Timestamp },
    DelayedStartArmed { task: u32, fire_in_secs: i64 },
    StateTransition { kind: SequencerKind, state: StateName },
    ProcedureFinished { kind: SequencerKind, sampled: bool },
    SampleExit { cause: ExitCause, max_pressure: f32 },
    SequenceFault { error: SequenceError },
    DetailLog { task: u32 },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ValveStatusChanged { valve, status } => {
                write!(f, "valve {valve} -> {status}")
            }
            EventKind::TaskStatusChanged { task, status } => {
                write!(f, "task {task} -> {status}")
            }
            EventKind::TaskDeleted { task } => write!(f, "task {task} deleted"),
            EventKind::MissedSchedule { task } => write!(f, "task {task} missed schedule"),
            EventKind::AlarmArmed { at } => write!(f, "rtc alarm armed for {at}"),
            EventKind::DelayedStartArmed { task, fire_in_secs } => {
                write!(f, "task {task} starting in {fire_in_secs}s")
            }
            EventKind::StateTransition { kind, state } => {
                write!(f, "{kind} entered {state}")
            }
            EventKind::ProcedureFinished { kind, sampled } => {
                if *sampled {
                    write!(f, "{kind} finished (valve sampled)")
                } else {
                    write!(f, "{kind} finished (valve released)")
                }
            }
            EventKind::SampleExit { cause, max_pressure } => {
                write!(f, "sample exit: {cause} (max pressure {max_pressure})")
            }
            EventKind::SequenceFault { error } => write!(f, "sequence fault: {error}"),
            EventKind::DetailLog { task } => write!(f, "detail log for task {task}"),
        }
    }
}

/// Event record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub id: EventId,
    pub at: Millis,
    pub kind: EventKind,
}

/// Records orchestration events into a fixed-size ring buffer.
pub struct EventLog<const CAPACITY: usize = EVENT_RING_CAPACITY> {
    ring: HistoryBuf<EventRecord, CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> EventLog<CAPACITY> {
    /// Creates a new event log with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Appends a record stamped with the provided uptime instant.
    pub fn record(&mut self, kind: EventKind, at: Millis) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(EventRecord { id, at, kind });
        id
    }

    /// Returns an iterator over the retained records in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, EventRecord> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent record, if any.
    pub fn latest(&self) -> Option<&EventRecord> {
        self.ring.recent()
    }

    /// Returns the number of retained records.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no records are retained.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns the total number of events recorded since boot, including
    /// records already evicted from the ring.
    pub fn recorded_total(&self) -> u32 {
        self.next_event_id
    }
}

impl<const CAPACITY: usize> Default for EventLog<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_ordered_and_numbered() {
        let mut log: EventLog<8> = EventLog::new();
        let first = log.record(EventKind::TaskDeleted { task: 7 }, Millis::from_millis(10));
        let second = log.record(
            EventKind::MissedSchedule { task: 9 },
            Millis::from_millis(20),
        );

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.latest().map(|record| record.kind),
            Some(EventKind::MissedSchedule { task: 9 })
        );

        let ids: heapless::Vec<EventId, 8> = log.oldest_first().map(|record| record.id).collect();
        assert_eq!(ids.as_slice(), &[0, 1]);
    }

    #[test]
    fn ring_evicts_oldest_but_keeps_counting() {
        let mut log: EventLog<2> = EventLog::new();
        for task in 0..5 {
            log.record(EventKind::TaskDeleted { task }, Millis::ZERO);
        }

        assert_eq!(log.len(), 2);
        assert_eq!(log.recorded_total(), 5);
        let oldest = log.oldest_first().next().expect("ring should be non-empty");
        assert_eq!(oldest.id, 3);
    }
}
