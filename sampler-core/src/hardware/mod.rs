//! Hardware seams for the sampler core.
//!
//! The orchestration logic is written against these traits so it runs
//! unchanged on the instrument, in the host emulator, and in tests. Drivers
//! are expected to be idempotent: the sequencer reasserts line state about
//! once a second and a driver must tolerate redundant writes.

use core::fmt;

use heapless::Vec;

use crate::tasks::{NowTaskRecord, TaskRecord};
use crate::time::{Millis, Timestamp};
use crate::valves::ValveStatus;
use crate::{MAX_TASKS, MAX_VALVES};

/// Fluid lines the sequencer can drive. At most one offshoot valve line is
/// open at a time alongside the shared flush, air, and alcohol lines.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineId {
    /// Main flush water path.
    Flush,
    /// Air intake used to dry the filter.
    Air,
    /// Alcohol reservoir used for preservation and purging.
    Alcohol,
    /// Offshoot line for the numbered sampling valve.
    Offshoot(u8),
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineId::Flush => write!(f, "flush"),
            LineId::Air => write!(f, "air"),
            LineId::Alcohol => write!(f, "alcohol"),
            LineId::Offshoot(valve) => write!(f, "offshoot[{valve}]"),
        }
    }
}

/// Pump drive command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PumpDrive {
    Off,
    Forward,
    Reverse,
}

/// Maximum number of lines a sequencer step asserts at once.
pub const MAX_OPEN_LINES: usize = 3;

/// Actuator outputs driven by the procedure sequencer.
pub trait ActuatorDriver {
    /// Drives the pump in the given direction, or stops it.
    fn pump(&mut self, drive: PumpDrive);

    /// Enables or disables the water intake.
    fn intake(&mut self, enabled: bool);

    /// Asserts exactly the given lines open, closing every other line.
    fn open_lines(&mut self, lines: &[LineId]);

    /// Closes every line, stops the pump, and disables the intake.
    fn release_all(&mut self);
}

/// Driver that ignores every command. Useful for dry-running schedules.
#[derive(Default)]
pub struct NoopActuatorDriver;

impl ActuatorDriver for NoopActuatorDriver {
    fn pump(&mut self, _drive: PumpDrive) {}
    fn intake(&mut self, _enabled: bool) {}
    fn open_lines(&mut self, _lines: &[LineId]) {}
    fn release_all(&mut self) {}
}

/// Instrument clock and wakeup alarm.
///
/// `now` is wall-clock time used for schedules; `uptime` is a monotonic
/// millisecond counter used to pace actions within a procedure. The two are
/// deliberately distinct so a wall-clock adjustment cannot distort an
/// in-flight procedure.
pub trait Clock {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Monotonic milliseconds since boot.
    fn uptime(&self) -> Millis;

    /// Arms the hardware wakeup alarm for the given wall-clock instant.
    fn schedule_alarm(&mut self, at: Timestamp);
}

/// Latest sensor readings, sampled once per control tick.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SensorFrame {
    /// Accumulated flow volume since the meter was last reset, in liters.
    pub volume: f32,
    /// Filter line pressure in PSI.
    pub pressure: f32,
    /// Water temperature in degrees Celsius.
    pub temperature: f32,
    /// Ambient barometric pressure in bars.
    pub barometric: f32,
}

/// Durable storage for task and valve records.
///
/// The core persists after every externally visible mutation so a power cut
/// mid-deployment loses at most the in-flight procedure.
pub trait Persistence {
    type Error: fmt::Debug;

    fn save_tasks(&mut self, tasks: &Vec<TaskRecord, MAX_TASKS>) -> Result<(), Self::Error>;
    fn save_valves(&mut self, statuses: &[ValveStatus; MAX_VALVES]) -> Result<(), Self::Error>;
    fn save_now_task(&mut self, record: &NowTaskRecord) -> Result<(), Self::Error>;
}

/// Persistence backend that drops every write.
#[derive(Default)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    type Error = core::convert::Infallible;

    fn save_tasks(&mut self, _tasks: &Vec<TaskRecord, MAX_TASKS>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn save_valves(&mut self, _statuses: &[ValveStatus; MAX_VALVES]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn save_now_task(&mut self, _record: &NowTaskRecord) -> Result<(), Self::Error> {
        Ok(())
    }
}
