//! Shared simulation harness for integration tests.

use std::convert::Infallible;

use heapless::Vec as HeaplessVec;
use sampler_core::hardware::{ActuatorDriver, Clock, LineId, Persistence, PumpDrive, SensorFrame};
use sampler_core::tasks::{NowTaskRecord, TaskRecord};
use sampler_core::time::{Millis, Timestamp};
use sampler_core::valves::ValveStatus;
use sampler_core::{MAX_TASKS, MAX_VALVES};

/// Deterministic clock whose wall time is derived from uptime.
pub struct SimClock {
    base_secs: i64,
    uptime: Millis,
    pub alarm: Option<Timestamp>,
}

impl SimClock {
    pub fn at(base_secs: i64) -> Self {
        Self {
            base_secs,
            uptime: Millis::ZERO,
            alarm: None,
        }
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.uptime = Millis::from_millis(self.uptime.as_millis() + ms);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        let elapsed = i64::try_from(self.uptime.as_millis() / 1000).unwrap();
        Timestamp::from_secs(self.base_secs + elapsed)
    }

    fn uptime(&self) -> Millis {
        self.uptime
    }

    fn schedule_alarm(&mut self, at: Timestamp) {
        self.alarm = Some(at);
    }
}

/// Driver that records its most recent outputs and a pump history.
#[derive(Default)]
pub struct SimDriver {
    pub pump: Option<PumpDrive>,
    pub intake: bool,
    pub lines: Vec<LineId>,
    pub line_writes: usize,
    pub pump_history: Vec<PumpDrive>,
    pub releases: usize,
}

impl ActuatorDriver for SimDriver {
    fn pump(&mut self, drive: PumpDrive) {
        if self.pump != Some(drive) {
            self.pump_history.push(drive);
        }
        self.pump = Some(drive);
    }

    fn intake(&mut self, enabled: bool) {
        self.intake = enabled;
    }

    fn open_lines(&mut self, lines: &[LineId]) {
        self.lines = lines.to_vec();
        self.line_writes += 1;
    }

    fn release_all(&mut self) {
        self.pump = Some(PumpDrive::Off);
        self.intake = false;
        self.lines.clear();
        self.releases += 1;
    }
}

/// Persistence backend that keeps the last write of each record kind.
#[derive(Default)]
pub struct MemoryPersistence {
    pub tasks: Option<HeaplessVec<TaskRecord, MAX_TASKS>>,
    pub valves: Option<[ValveStatus; MAX_VALVES]>,
    pub now_task: Option<NowTaskRecord>,
    pub task_saves: usize,
    pub valve_saves: usize,
}

impl Persistence for MemoryPersistence {
    type Error = Infallible;

    fn save_tasks(&mut self, tasks: &HeaplessVec<TaskRecord, MAX_TASKS>) -> Result<(), Infallible> {
        self.tasks = Some(tasks.clone());
        self.task_saves += 1;
        Ok(())
    }

    fn save_valves(&mut self, statuses: &[ValveStatus; MAX_VALVES]) -> Result<(), Infallible> {
        self.valves = Some(*statuses);
        self.valve_saves += 1;
        Ok(())
    }

    fn save_now_task(&mut self, record: &NowTaskRecord) -> Result<(), Infallible> {
        self.now_task = Some(*record);
        Ok(())
    }
}

/// Idle sensor frame.
pub fn still_water() -> SensorFrame {
    SensorFrame::default()
}
