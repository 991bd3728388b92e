//! Task records and the fixed-capacity task store.
//!
//! A task is a named sampling plan: a list of claimed valves, per-phase
//! parameters, and a wall-clock schedule. The store owns every record and
//! hands out ids, which are random and non-zero so a stale id from a
//! previous deployment never silently aliases a new task.

use core::fmt;

use heapless::{String, Vec};

use crate::time::Timestamp;
use crate::{MAX_TASKS, MAX_VALVES};

/// Maximum length of task names and notes.
pub const NAME_CAPACITY: usize = 24;
pub const NOTES_CAPACITY: usize = 64;

/// Minimum gap between consecutive runs of the same task, in seconds.
pub const MIN_TIME_BETWEEN_SECS: i64 = 5;

/// Lifecycle of a task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    /// Editable, not yet scheduled.
    #[default]
    Draft,
    /// Scheduled and competing for the next wakeup.
    Active,
    /// Every claimed valve has been processed or released.
    Completed,
    /// The schedule passed without the procedure running.
    Missed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Missed => "missed",
        };
        f.write_str(text)
    }
}

/// Per-phase procedure parameters carried by each task.
///
/// Times are in seconds, volumes in liters, pressure in PSI. A phase exits
/// on whichever limit is reached first.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhaseParams {
    pub flush_time: i64,
    pub flush_volume: f32,
    pub sample_time: i64,
    pub sample_volume: f32,
    pub sample_pressure: f32,
    pub dry_time: i64,
    pub preserve_time: i64,
}

impl Default for PhaseParams {
    fn default() -> Self {
        Self {
            flush_time: 150,
            flush_volume: 1.0,
            sample_time: 150,
            sample_volume: 1.0,
            sample_pressure: 8.0,
            dry_time: 10,
            preserve_time: 10,
        }
    }
}

/// One stored sampling task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: u32,
    pub name: String<NAME_CAPACITY>,
    pub notes: String<NOTES_CAPACITY>,
    pub created_at: Timestamp,
    pub schedule: Timestamp,
    pub status: TaskStatus,
    /// Seconds between consecutive valve runs.
    pub time_between: i64,
    pub params: PhaseParams,
    /// Valves claimed by this task, processed front to back.
    pub valves: Vec<u8, MAX_VALVES>,
    /// Index of the next valve to process.
    pub valve_offset: usize,
    /// Drop the record from the store once its final valve is done.
    pub delete_on_completion: bool,
}

impl TaskRecord {
    fn new(id: u32, name: String<NAME_CAPACITY>, created_at: Timestamp) -> Self {
        Self {
            id,
            name,
            notes: String::new(),
            created_at,
            schedule: created_at,
            status: TaskStatus::Draft,
            time_between: MIN_TIME_BETWEEN_SECS,
            params: PhaseParams::default(),
            valves: Vec::new(),
            valve_offset: 0,
            delete_on_completion: false,
        }
    }

    /// The valve the next run of this task will drive.
    #[must_use]
    pub fn current_valve(&self) -> Option<u8> {
        self.valves.get(self.valve_offset).copied()
    }

    /// Valves not yet processed, including the current one.
    #[must_use]
    pub fn remaining_valves(&self) -> &[u8] {
        self.valves.get(self.valve_offset..).unwrap_or(&[])
    }

    /// Moves to the next valve after a run finishes. Returns `true` when the
    /// task completed. The next schedule is pushed out by `time_between`,
    /// floored so back-to-back runs cannot collapse into the same second.
    pub fn advance(&mut self, now: Timestamp) -> bool {
        self.schedule = now + self.time_between.max(MIN_TIME_BETWEEN_SECS);
        self.valve_offset += 1;
        if self.valve_offset >= self.valves.len() {
            self.mark_completed();
            true
        } else {
            false
        }
    }

    /// Marks the task completed and drops its valve claims.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.valves.clear();
        self.valve_offset = 0;
    }

    /// Marks the task missed. Valve claims are dropped; the scheduler has
    /// already released or kept the physical valves as appropriate.
    pub fn mark_missed(&mut self) {
        self.status = TaskStatus::Missed;
        self.valves.clear();
        self.valve_offset = 0;
    }
}

/// Immediate sampling request, persisted separately from the task table.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NowTaskRecord {
    /// Valve claimed for the immediate run. `None` until one is assigned.
    pub valve: Option<u8>,
    pub params: PhaseParams,
}

/// Errors from store mutations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskStoreError {
    /// The task table is at capacity.
    Full,
    /// No task with the given id exists.
    NotFound,
    /// The mutation is only legal on a draft task.
    NotDraft,
    /// The task's valve list is at capacity.
    TooManyValves,
}

impl fmt::Display for TaskStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStoreError::Full => "task table full",
            TaskStoreError::NotFound => "no such task",
            TaskStoreError::NotDraft => "task is not editable",
            TaskStoreError::TooManyValves => "too many valves on task",
        };
        f.write_str(text)
    }
}

/// Deterministic splitmix64 stream used to mint task ids.
pub struct IdSource {
    state: u64,
}

impl IdSource {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Returns a non-zero id not present in `taken`.
    fn mint(&mut self, taken: impl Fn(u32) -> bool + Copy) -> u32 {
        loop {
            let candidate = (self.next_u64() >> 32) as u32;
            if candidate != 0 && !taken(candidate) {
                return candidate;
            }
        }
    }
}

/// Fixed-capacity table of task records.
pub struct TaskStore {
    tasks: Vec<TaskRecord, MAX_TASKS>,
    ids: IdSource,
}

impl TaskStore {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            tasks: Vec::new(),
            ids: IdSource::new(seed),
        }
    }

    /// Restores a store from persisted records.
    pub fn from_records(records: Vec<TaskRecord, MAX_TASKS>, seed: u64) -> Self {
        Self {
            tasks: records,
            ids: IdSource::new(seed),
        }
    }

    /// Creates a draft task and returns its id.
    pub fn create(&mut self, name: &str, now: Timestamp) -> Result<u32, TaskStoreError> {
        if self.tasks.is_full() {
            return Err(TaskStoreError::Full);
        }
        let tasks = &self.tasks;
        let id = self.ids.mint(|candidate| {
            tasks.iter().any(|t| t.id == candidate)
        });
        let record = TaskRecord::new(id, clamp_str(name), now);
        // Capacity was checked above.
        let _ = self.tasks.push(record);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&TaskRecord> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Removes the task with the given id.
    pub fn delete(&mut self, id: u32) -> Result<TaskRecord, TaskStoreError> {
        let index = self
            .tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or(TaskStoreError::NotFound)?;
        Ok(self.tasks.swap_remove(index))
    }

    /// Removes every task matching the predicate, returning how many went.
    pub fn delete_if(&mut self, mut predicate: impl FnMut(&TaskRecord) -> bool) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|task| !predicate(task));
        before - self.tasks.len()
    }

    /// Replaces the draft task's valve claims.
    pub fn set_valves(&mut self, id: u32, valves: &[u8]) -> Result<(), TaskStoreError> {
        let task = self.get_mut(id).ok_or(TaskStoreError::NotFound)?;
        if task.status != TaskStatus::Draft {
            return Err(TaskStoreError::NotDraft);
        }
        task.valves =
            Vec::from_slice(valves).map_err(|_| TaskStoreError::TooManyValves)?;
        task.valve_offset = 0;
        Ok(())
    }

    /// Ids of active tasks ordered by schedule, earliest first. Ties keep no
    /// particular order.
    #[must_use]
    pub fn active_ids_by_schedule(&self) -> Vec<u32, MAX_TASKS> {
        let mut active: Vec<&TaskRecord, MAX_TASKS> = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Active)
            .collect();
        active.sort_unstable_by_key(|task| task.schedule.as_secs());
        active.iter().map(|task| task.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub const fn records(&self) -> &Vec<TaskRecord, MAX_TASKS> {
        &self.tasks
    }
}

/// Truncates `input` to the target capacity on a character boundary.
fn clamp_str<const CAPACITY: usize>(input: &str) -> String<CAPACITY> {
    let mut out = String::new();
    for ch in input.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Truncating conversion for task notes.
#[must_use]
pub fn clamp_notes(input: &str) -> String<NOTES_CAPACITY> {
    clamp_str(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(0x5eed)
    }

    #[test]
    fn created_tasks_get_distinct_nonzero_ids() {
        let mut store = store();
        let a = store.create("deep", Timestamp::from_secs(100)).unwrap();
        let b = store.create("shallow", Timestamp::from_secs(100)).unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(store.get(a).unwrap().status, TaskStatus::Draft);
    }

    #[test]
    fn valve_claims_beyond_capacity_are_rejected() {
        let mut store = store();
        let id = store.create("big", Timestamp::from_secs(0)).unwrap();
        let claims = [0u8; MAX_VALVES + 1];
        assert_eq!(
            store.set_valves(id, &claims),
            Err(TaskStoreError::TooManyValves)
        );
    }

    #[test]
    fn advance_steps_valves_and_completes() {
        let mut store = store();
        let id = store.create("run", Timestamp::from_secs(0)).unwrap();
        store.set_valves(id, &[4, 5]).unwrap();

        let task = store.get_mut(id).unwrap();
        task.time_between = 60;
        assert_eq!(task.current_valve(), Some(4));

        assert!(!task.advance(Timestamp::from_secs(1000)));
        assert_eq!(task.schedule, Timestamp::from_secs(1060));
        assert_eq!(task.current_valve(), Some(5));

        assert!(task.advance(Timestamp::from_secs(1100)));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.valves.is_empty());
    }

    #[test]
    fn advance_floors_short_intervals() {
        let mut store = store();
        let id = store.create("fast", Timestamp::from_secs(0)).unwrap();
        store.set_valves(id, &[0, 1]).unwrap();
        let task = store.get_mut(id).unwrap();
        task.time_between = 0;

        task.advance(Timestamp::from_secs(500));
        assert_eq!(task.schedule, Timestamp::from_secs(505));
    }

    #[test]
    fn active_ids_sorted_by_schedule() {
        let mut store = store();
        let late = store.create("late", Timestamp::from_secs(0)).unwrap();
        let early = store.create("early", Timestamp::from_secs(0)).unwrap();
        let draft = store.create("draft", Timestamp::from_secs(0)).unwrap();

        store.get_mut(late).unwrap().status = TaskStatus::Active;
        store.get_mut(late).unwrap().schedule = Timestamp::from_secs(900);
        store.get_mut(early).unwrap().status = TaskStatus::Active;
        store.get_mut(early).unwrap().schedule = Timestamp::from_secs(300);

        let ids = store.active_ids_by_schedule();
        assert_eq!(ids.as_slice(), &[early, late]);
        assert!(!ids.contains(&draft));
    }

    #[test]
    fn set_valves_rejects_active_tasks() {
        let mut store = store();
        let id = store.create("locked", Timestamp::from_secs(0)).unwrap();
        store.get_mut(id).unwrap().status = TaskStatus::Active;
        assert_eq!(store.set_valves(id, &[1]), Err(TaskStoreError::NotDraft));
    }

    #[test]
    fn delete_unknown_id_fails() {
        let mut store = store();
        assert_eq!(store.delete(42), Err(TaskStoreError::NotFound));
    }

    #[test]
    fn delete_if_sweeps_matching_tasks() {
        let mut store = store();
        let done = store.create("done", Timestamp::from_secs(0)).unwrap();
        let keep = store.create("keep", Timestamp::from_secs(0)).unwrap();
        store.get_mut(done).unwrap().mark_completed();

        let removed =
            store.delete_if(|task| task.status == TaskStatus::Completed);
        assert_eq!(removed, 1);
        assert!(store.get(done).is_none());
        assert!(store.get(keep).is_some());
    }

    #[test]
    fn missed_tasks_leave_the_active_queue() {
        let mut store = store();
        let id = store.create("late", Timestamp::from_secs(0)).unwrap();
        store.set_valves(id, &[7]).unwrap();
        store.get_mut(id).unwrap().status = TaskStatus::Active;

        store.get_mut(id).unwrap().mark_missed();
        assert!(store.active_ids_by_schedule().is_empty());
        assert!(store.get(id).unwrap().valves.is_empty());
    }

    #[test]
    fn long_names_are_clamped() {
        let mut store = store();
        let id = store
            .create(
                "a-very-long-name-that-exceeds-the-record-capacity",
                Timestamp::from_secs(0),
            )
            .unwrap();
        assert_eq!(store.get(id).unwrap().name.len(), NAME_CAPACITY);
    }
}
