//! Relative-time action scheduler.
//!
//! Actions fire against the monotonic uptime clock, not wall-clock time, so
//! they pace work within a procedure regardless of clock adjustments. Firing
//! does not run code directly: each action carries a `Copy` event that the
//! owner interprets, which keeps the scheduler free of callback lifetimes.

use core::fmt;

use heapless::Vec;

use crate::time::Millis;

/// Maximum number of concurrently registered actions.
pub const MAX_ACTIONS: usize = 16;

/// How often an action fires before it is removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Fire once, then remove.
    Once,
    /// Fire the given number of additional times after the first.
    Times(u32),
    /// Fire until cancelled.
    Forever,
}

/// A single scheduled action.
#[derive(Copy, Clone, Debug)]
struct TimedAction<E> {
    name: &'static str,
    start: Millis,
    interval_ms: u64,
    repeat: Repeat,
    removable: bool,
    event: E,
}

/// Error returned when the action table is full.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActionTableFull;

impl fmt::Display for ActionTableFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action table full")
    }
}

/// Fixed-capacity scheduler firing events at relative intervals.
///
/// Insertion order is preserved: actions registered earlier fire earlier
/// within the same tick.
pub struct ActionScheduler<E, const CAPACITY: usize = MAX_ACTIONS> {
    actions: Vec<TimedAction<E>, CAPACITY>,
}

impl<E: Copy, const CAPACITY: usize> ActionScheduler<E, CAPACITY> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers an action that fires once, `interval_ms` from `now`.
    pub fn run_once(
        &mut self,
        name: &'static str,
        now: Millis,
        interval_ms: u64,
        event: E,
    ) -> Result<(), ActionTableFull> {
        self.register(name, now, interval_ms, Repeat::Once, event)
    }

    /// Registers an action that fires every `interval_ms` until cancelled.
    pub fn run_forever(
        &mut self,
        name: &'static str,
        now: Millis,
        interval_ms: u64,
        event: E,
    ) -> Result<(), ActionTableFull> {
        self.register(name, now, interval_ms, Repeat::Forever, event)
    }

    /// Registers an action with an explicit repeat policy.
    pub fn register(
        &mut self,
        name: &'static str,
        now: Millis,
        interval_ms: u64,
        repeat: Repeat,
        event: E,
    ) -> Result<(), ActionTableFull> {
        let action = TimedAction {
            name,
            start: now,
            interval_ms,
            repeat,
            removable: false,
            event,
        };
        self.actions.push(action).map_err(|_| ActionTableFull)
    }

    /// Marks every action with the given name for removal. The removal takes
    /// effect at the start of the next `tick`, so a cancelled action never
    /// fires again.
    pub fn cancel(&mut self, name: &'static str) {
        for action in &mut self.actions {
            if action.name == name {
                action.removable = true;
            }
        }
    }

    /// Removes spent actions, then fires every due action in insertion
    /// order, appending fired events to `fired`.
    pub fn tick<const OUT: usize>(&mut self, now: Millis, fired: &mut Vec<E, OUT>) {
        self.actions.retain(|action| !action.removable);

        for action in &mut self.actions {
            let elapsed = now.as_millis().saturating_sub(action.start.as_millis());
            if elapsed < action.interval_ms {
                continue;
            }
            let pushed = fired.push(action.event).is_ok();
            debug_assert!(pushed, "fired-event buffer overflow");
            match action.repeat {
                Repeat::Once => action.removable = true,
                Repeat::Times(remaining) => {
                    if remaining == 0 {
                        action.removable = true;
                    } else {
                        action.repeat = Repeat::Times(remaining - 1);
                        action.start = now;
                    }
                }
                Repeat::Forever => action.start = now,
            }
        }
    }

    /// Returns `true` when an action with the given name is registered and
    /// not already marked for removal.
    pub fn is_scheduled(&self, name: &'static str) -> bool {
        self.actions
            .iter()
            .any(|action| action.name == name && !action.removable)
    }

    /// Drops every registered action immediately.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn len(&self) -> usize {
        self.actions.iter().filter(|a| !a.removable).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Copy, const CAPACITY: usize> Default for ActionScheduler<E, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired_events<const CAP: usize>(
        scheduler: &mut ActionScheduler<u8, CAP>,
        now: Millis,
    ) -> Vec<u8, 8> {
        let mut fired = Vec::new();
        scheduler.tick(now, &mut fired);
        fired
    }

    #[test]
    fn one_shot_fires_once_then_disappears() {
        let mut scheduler: ActionScheduler<u8, 4> = ActionScheduler::new();
        scheduler
            .run_once("wake", Millis::from_millis(0), 100, 1)
            .unwrap();

        assert!(fired_events(&mut scheduler, Millis::from_millis(50)).is_empty());
        assert_eq!(
            fired_events(&mut scheduler, Millis::from_millis(100)).as_slice(),
            &[1]
        );
        assert!(fired_events(&mut scheduler, Millis::from_millis(500)).is_empty());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn forever_action_rebases_each_fire() {
        let mut scheduler: ActionScheduler<u8, 4> = ActionScheduler::new();
        scheduler
            .run_forever("reassert", Millis::from_millis(0), 100, 2)
            .unwrap();

        assert_eq!(
            fired_events(&mut scheduler, Millis::from_millis(100)).as_slice(),
            &[2]
        );
        // Rebased to 100ms, so 150ms is too early.
        assert!(fired_events(&mut scheduler, Millis::from_millis(150)).is_empty());
        assert_eq!(
            fired_events(&mut scheduler, Millis::from_millis(200)).as_slice(),
            &[2]
        );
    }

    #[test]
    fn bounded_repeat_counts_down() {
        let mut scheduler: ActionScheduler<u8, 4> = ActionScheduler::new();
        scheduler
            .register("pulse", Millis::from_millis(0), 10, Repeat::Times(2), 3)
            .unwrap();

        for step in 1..=3u64 {
            assert_eq!(
                fired_events(&mut scheduler, Millis::from_millis(step * 10)).as_slice(),
                &[3]
            );
        }
        assert!(fired_events(&mut scheduler, Millis::from_millis(100)).is_empty());
    }

    #[test]
    fn cancelled_action_never_fires_again() {
        let mut scheduler: ActionScheduler<u8, 4> = ActionScheduler::new();
        scheduler
            .run_forever("reassert", Millis::from_millis(0), 10, 4)
            .unwrap();
        scheduler
            .run_once("wake", Millis::from_millis(0), 10, 5)
            .unwrap();

        scheduler.cancel("reassert");
        assert_eq!(
            fired_events(&mut scheduler, Millis::from_millis(10)).as_slice(),
            &[5]
        );
        assert!(scheduler.is_empty());
    }

    #[test]
    fn insertion_order_is_firing_order() {
        let mut scheduler: ActionScheduler<u8, 4> = ActionScheduler::new();
        scheduler.run_once("a", Millis::ZERO, 10, 10).unwrap();
        scheduler.run_once("b", Millis::ZERO, 5, 20).unwrap();

        // Both due; the earlier registration still fires first.
        assert_eq!(
            fired_events(&mut scheduler, Millis::from_millis(20)).as_slice(),
            &[10, 20]
        );
    }

    #[test]
    fn full_table_rejects_registration() {
        let mut scheduler: ActionScheduler<u8, 1> = ActionScheduler::new();
        scheduler.run_once("a", Millis::ZERO, 10, 1).unwrap();
        assert_eq!(
            scheduler.run_once("b", Millis::ZERO, 10, 2),
            Err(ActionTableFull)
        );
    }
}
