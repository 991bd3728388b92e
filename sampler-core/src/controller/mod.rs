//! Top-level orchestration.
//!
//! The controller owns the task store, valve bank, sequencer, and action
//! scheduler, and is the only place that mutates them. Host surfaces call
//! into it and render the snapshots and event log it exposes; hardware
//! specifics stay behind the driver and clock traits.
//!
//! Scheduling model: active tasks compete by schedule time. Outside the
//! wake window the controller arms the hardware alarm and allows shutdown;
//! inside it, a delayed-start action is armed and shutdown is held off
//! until the run finishes.

use core::fmt;

use heapless::Vec;

use crate::actions::{ActionScheduler, ActionTableFull, MAX_ACTIONS};
use crate::config::Config;
use crate::hardware::{ActuatorDriver, Clock, Persistence, SensorFrame};
use crate::procedure::{SequenceError, Sequencer, SequencerKind, SequencerSignal};
use crate::status::StatusSnapshot;
use crate::tasks::{
    NowTaskRecord, PhaseParams, TaskStatus, TaskStore, TaskStoreError,
};
use crate::telemetry::{EventKind, EventLog};
use crate::time::{Millis, Timestamp};
use crate::valves::{ValveBank, ValveStatus};
use crate::MAX_VALVES;

const DELAYED_START: &str = "delayed-start";
const DETAIL_LOG: &str = "detail-log";

/// Outcome of a scheduling pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleCode {
    /// No active task remains; the controller is free to shut down.
    Unavailable,
    /// A task is inside the wake window; a delayed start is armed.
    Operating,
    /// The next task is in the future; the wakeup alarm is armed.
    Scheduled,
}

/// Rejections from task scheduling validation. Validation never mutates
/// state, so a rejected request leaves the store untouched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    NotFound,
    /// The task has no valves claimed.
    NoValves,
    /// The schedule is not far enough in the future.
    LeadTooShort { required_secs: i64 },
    /// A claimed valve number does not address a real slot.
    ValveOutOfRange(u8),
    /// A claimed valve cannot be scheduled in its current status.
    ValveBusy { valve: u8, status: ValveStatus },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::NotFound => f.write_str("no such task"),
            ScheduleError::NoValves => f.write_str("task has no valves"),
            ScheduleError::LeadTooShort { required_secs } => {
                write!(f, "schedule must be more than {required_secs}s out")
            }
            ScheduleError::ValveOutOfRange(valve) => {
                write!(f, "valve {valve} does not exist")
            }
            ScheduleError::ValveBusy { valve, status } => {
                write!(f, "valve {valve} is {status}")
            }
        }
    }
}

/// Rejections from starting an immediate procedure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BeginError {
    /// A procedure is already running.
    Busy,
    /// No free valve is available to claim.
    NoFreeValve,
}

impl fmt::Display for BeginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeginError::Busy => f.write_str("a procedure is already running"),
            BeginError::NoFreeValve => f.write_str("no free valve available"),
        }
    }
}

/// Errors surfaced by controller operations.
#[derive(Debug, PartialEq)]
pub enum ControlError<PE> {
    Sequence(SequenceError),
    Schedule(ScheduleError),
    Begin(BeginError),
    Store(TaskStoreError),
    Actions(ActionTableFull),
    Persist(PE),
}

impl<PE: fmt::Debug> fmt::Display for ControlError<PE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Sequence(error) => write!(f, "{error}"),
            ControlError::Schedule(error) => write!(f, "{error}"),
            ControlError::Begin(error) => write!(f, "{error}"),
            ControlError::Store(error) => write!(f, "{error}"),
            ControlError::Actions(error) => write!(f, "{error}"),
            ControlError::Persist(error) => write!(f, "storage failure: {error:?}"),
        }
    }
}

impl<PE> From<SequenceError> for ControlError<PE> {
    fn from(error: SequenceError) -> Self {
        ControlError::Sequence(error)
    }
}

impl<PE> From<ScheduleError> for ControlError<PE> {
    fn from(error: ScheduleError) -> Self {
        ControlError::Schedule(error)
    }
}

impl<PE> From<BeginError> for ControlError<PE> {
    fn from(error: BeginError) -> Self {
        ControlError::Begin(error)
    }
}

impl<PE> From<TaskStoreError> for ControlError<PE> {
    fn from(error: TaskStoreError) -> Self {
        ControlError::Store(error)
    }
}

impl<PE> From<ActionTableFull> for ControlError<PE> {
    fn from(error: ActionTableFull) -> Self {
        ControlError::Actions(error)
    }
}

/// Events dispatched by the controller's action scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ControlEvent {
    StartTask { task: u32 },
    DetailLog,
}

/// The sampler's orchestration core. One instance owns all mutable state.
pub struct Controller<D, P>
where
    D: ActuatorDriver,
    P: Persistence,
{
    driver: D,
    persistence: P,
    config: Config,
    valves: ValveBank,
    tasks: TaskStore,
    now_task: NowTaskRecord,
    sequencer: Sequencer,
    actions: ActionScheduler<ControlEvent, MAX_ACTIONS>,
    log: EventLog,
    current_task: Option<u32>,
    prevent_shutdown: bool,
    fault_handled: bool,
    last_sensors: SensorFrame,
}

impl<D, P> Controller<D, P>
where
    D: ActuatorDriver,
    P: Persistence,
{
    pub fn new(driver: D, persistence: P, config: Config, id_seed: u64) -> Self {
        Self {
            driver,
            persistence,
            config,
            valves: ValveBank::new(),
            tasks: TaskStore::new(id_seed),
            now_task: NowTaskRecord::default(),
            sequencer: Sequencer::new(),
            actions: ActionScheduler::new(),
            log: EventLog::new(),
            current_task: None,
            prevent_shutdown: false,
            fault_handled: false,
            last_sensors: SensorFrame::default(),
        }
    }

    /// Restores a controller from persisted state.
    pub fn with_state(
        driver: D,
        persistence: P,
        config: Config,
        id_seed: u64,
        valves: ValveBank,
        tasks: TaskStore,
        now_task: NowTaskRecord,
    ) -> Self {
        let mut controller = Self::new(driver, persistence, config, id_seed);
        controller.valves = valves;
        controller.tasks = tasks;
        controller.now_task = now_task;
        controller
    }

    /// Advances the core by one control tick.
    pub fn tick<C: Clock>(
        &mut self,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        self.last_sensors = sensors;

        let mut events: Vec<ControlEvent, 8> = Vec::new();
        self.actions.tick(uptime, &mut events);
        for event in events {
            match event {
                ControlEvent::StartTask { task } => self.launch_task(task, clock, sensors)?,
                ControlEvent::DetailLog => {
                    let task = self.current_task.unwrap_or(0);
                    self.log.record(EventKind::DetailLog { task }, uptime);
                }
            }
        }

        match self.sequencer.tick(uptime, sensors, &mut self.driver) {
            Ok(signals) => self.handle_signals(&signals, clock)?,
            Err(error) => {
                if !self.fault_handled {
                    self.handle_fault(error, clock)?;
                    return Err(ControlError::Sequence(error));
                }
            }
        }

        // Rescheduling is driven here rather than by the hardware alarm so
        // the core behaves the same under emulation.
        if !self.sequencer.is_active()
            && self.current_task.is_none()
            && !self.actions.is_scheduled(DELAYED_START)
            && self.wake_window_reached(clock.now())
        {
            self.schedule_next_active_task(clock, false)?;
        }
        Ok(())
    }

    /// Entry point for the hardware wakeup alarm.
    pub fn on_wake<C: Clock>(
        &mut self,
        clock: &mut C,
    ) -> Result<ScheduleCode, ControlError<P::Error>> {
        self.schedule_next_active_task(clock, false)
    }

    /// Picks the next task to run, walking active tasks in schedule order.
    ///
    /// Missed tasks are invalidated as they are encountered, so a single
    /// pass both cleans up the past and arms the future. With `stop_current`
    /// the currently armed task is released first.
    pub fn schedule_next_active_task<C: Clock>(
        &mut self,
        clock: &mut C,
        stop_current: bool,
    ) -> Result<ScheduleCode, ControlError<P::Error>> {
        self.prevent_shutdown = false;
        let now = clock.now();
        let uptime = clock.uptime();

        for id in self.tasks.active_ids_by_schedule() {
            if self.current_task == Some(id) {
                if stop_current {
                    self.actions.cancel(DELAYED_START);
                    self.current_task = None;
                    self.release_next_valve(id, uptime);
                    continue;
                }
                self.prevent_shutdown = true;
                return Ok(ScheduleCode::Operating);
            }

            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            let schedule = task.schedule;
            let valve = task.current_valve();

            if now.as_secs() >= schedule.as_secs() {
                self.log.record(EventKind::MissedSchedule { task: id }, uptime);
                self.invalidate_missed_task(id, uptime)?;
                continue;
            }

            let lead = now.seconds_until(schedule);
            if lead <= self.config.wake_window_secs {
                let Some(valve) = valve else {
                    // An active task without valves cannot run.
                    self.invalidate_missed_task(id, uptime)?;
                    continue;
                };
                self.actions.run_once(
                    DELAYED_START,
                    uptime,
                    u64::try_from(lead).unwrap_or(0) * 1000,
                    ControlEvent::StartTask { task: id },
                )?;
                self.set_valve_status(valve, ValveStatus::Next, uptime);
                self.log.record(
                    EventKind::DelayedStartArmed {
                        task: id,
                        fire_in_secs: lead,
                    },
                    uptime,
                );
                self.current_task = Some(id);
                self.prevent_shutdown = true;
                self.persist_valves()?;
                return Ok(ScheduleCode::Operating);
            }

            let alarm_at = schedule - self.config.pre_alarm_margin_secs;
            clock.schedule_alarm(alarm_at);
            self.log.record(EventKind::AlarmArmed { at: alarm_at }, uptime);
            return Ok(ScheduleCode::Scheduled);
        }

        self.current_task = None;
        Ok(ScheduleCode::Unavailable)
    }

    /// Checks whether a task could be scheduled at its current parameters.
    /// All checks run before any mutation, so a failure changes nothing.
    pub fn validate_for_scheduling(
        &self,
        id: u32,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<(), ScheduleError> {
        let task = self.tasks.get(id).ok_or(ScheduleError::NotFound)?;
        if task.valves.is_empty() {
            return Err(ScheduleError::NoValves);
        }
        if at.as_secs() <= now.as_secs() + self.config.min_lead_secs {
            return Err(ScheduleError::LeadTooShort {
                required_secs: self.config.min_lead_secs,
            });
        }
        for &valve in &task.valves {
            if !self.valves.contains(valve) {
                return Err(ScheduleError::ValveOutOfRange(valve));
            }
            let status = self.valves.status(valve);
            if !status.is_schedulable() {
                return Err(ScheduleError::ValveBusy { valve, status });
            }
        }
        Ok(())
    }

    /// Activates a task at the given schedule and runs a scheduling pass.
    pub fn schedule_task<C: Clock>(
        &mut self,
        id: u32,
        at: Timestamp,
        clock: &mut C,
    ) -> Result<ScheduleCode, ControlError<P::Error>> {
        let now = clock.now();
        let uptime = clock.uptime();
        self.validate_for_scheduling(id, at, now)?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.schedule = at;
            task.status = TaskStatus::Active;
        }
        self.log.record(
            EventKind::TaskStatusChanged {
                task: id,
                status: TaskStatus::Active,
            },
            uptime,
        );
        self.persist_tasks()?;
        self.schedule_next_active_task(clock, false)
    }

    /// Takes a task out of rotation. A mid-run task is driven through its
    /// stop state first, so a completed sample phase still marks the valve
    /// sampled; the task ends up completed with its unused valves freed.
    pub fn unschedule_task<C: Clock>(
        &mut self,
        id: u32,
        clock: &mut C,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        if self.tasks.get(id).is_none() {
            return Err(ScheduleError::NotFound.into());
        }

        if self.current_task == Some(id) && self.sequencer.is_active() {
            let signals =
                match self.sequencer.stop(uptime, self.last_sensors, &mut self.driver) {
                    Ok(signals) => signals,
                    Err(error) => {
                        self.handle_fault(error, clock)?;
                        return Err(ControlError::Sequence(error));
                    }
                };
            // The stop signals settle the running valve's disposition;
            // retirement only frees the valves the run never reached.
            self.current_task = None;
            self.retire_task(id, Some(self.sequencer.valve()), uptime)?;
            self.handle_signals(&signals, clock)?;
        } else if self.current_task == Some(id) {
            // Armed but not launched. The scheduling pass releases the
            // reservation and falls through to the next candidate.
            self.schedule_next_active_task(clock, true)?;
            self.retire_task(id, None, uptime)?;
        } else {
            self.retire_task(id, None, uptime)?;
            self.schedule_next_active_task(clock, false)?;
        }
        Ok(())
    }

    /// Creates a draft task.
    pub fn create_task<C: Clock>(
        &mut self,
        name: &str,
        clock: &C,
    ) -> Result<u32, ControlError<P::Error>> {
        let id = self.tasks.create(name, clock.now())?;
        self.persist_tasks()?;
        Ok(id)
    }

    /// Removes a task entirely, stopping it first if necessary.
    pub fn delete_task<C: Clock>(
        &mut self,
        id: u32,
        clock: &mut C,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        if self.current_task == Some(id) || self.tasks.get(id).map(|t| t.status)
            == Some(TaskStatus::Active)
        {
            self.unschedule_task(id, clock)?;
        }
        self.tasks.delete(id)?;
        self.log.record(EventKind::TaskDeleted { task: id }, uptime);
        self.persist_tasks()?;
        Ok(())
    }

    /// Replaces a draft task's valve claims.
    pub fn set_task_valves(
        &mut self,
        id: u32,
        valves: &[u8],
    ) -> Result<(), ControlError<P::Error>> {
        for &valve in valves {
            if !self.valves.contains(valve) {
                return Err(ScheduleError::ValveOutOfRange(valve).into());
            }
        }
        self.tasks.set_valves(id, valves)?;
        self.persist_tasks()?;
        Ok(())
    }

    /// Updates a draft task's timing and phase parameters.
    pub fn set_task_timing(
        &mut self,
        id: u32,
        time_between: i64,
        params: PhaseParams,
    ) -> Result<(), ControlError<P::Error>> {
        let task = self.tasks.get_mut(id).ok_or(TaskStoreError::NotFound)?;
        if task.status != TaskStatus::Draft {
            return Err(TaskStoreError::NotDraft.into());
        }
        task.time_between = time_between;
        task.params = params;
        self.persist_tasks()?;
        Ok(())
    }

    /// Starts an immediate sample on the given valve, or the first free one.
    pub fn begin_now_task<C: Clock>(
        &mut self,
        valve: Option<u8>,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<u8, ControlError<P::Error>> {
        self.ensure_idle()?;
        let uptime = clock.uptime();
        let valve = match valve {
            Some(valve) if self.valves.contains(valve) => valve,
            Some(valve) => return Err(ScheduleError::ValveOutOfRange(valve).into()),
            None => self.valves.first_free().ok_or(BeginError::NoFreeValve)?,
        };
        if self.valves.status(valve) != ValveStatus::Free {
            return Err(ControlError::Schedule(ScheduleError::ValveBusy {
                valve,
                status: self.valves.status(valve),
            }));
        }
        self.now_task.valve = Some(valve);
        let params = self.now_task.params;
        self.set_valve_status(valve, ValveStatus::Operating, uptime);
        self.start_procedure(SequencerKind::Now, valve, &params, clock, sensors)?;
        self.persist_now_task()?;
        self.persist_valves()?;
        Ok(valve)
    }

    /// Starts a high-volume flush that also preloads a free offshoot line.
    pub fn begin_hyper_flush<C: Clock>(
        &mut self,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<u8, ControlError<P::Error>> {
        self.ensure_idle()?;
        let uptime = clock.uptime();
        let valve = self.valves.first_free().ok_or(BeginError::NoFreeValve)?;
        let params = self.now_task.params;
        self.set_valve_status(valve, ValveStatus::Operating, uptime);
        self.start_procedure(SequencerKind::HyperFlush, valve, &params, clock, sensors)?;
        self.persist_valves()?;
        Ok(valve)
    }

    /// Starts an alcohol purge. No valve is claimed.
    pub fn begin_debubble<C: Clock>(
        &mut self,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<(), ControlError<P::Error>> {
        self.ensure_idle()?;
        let params = self.now_task.params;
        self.start_procedure(SequencerKind::Debubble, 0, &params, clock, sensors)
    }

    /// Whether the instrument may power down right now.
    #[must_use]
    pub fn allow_shutdown(&self) -> bool {
        !self.prevent_shutdown && !self.sequencer.is_active()
    }

    #[must_use]
    pub fn snapshot<C: Clock>(&self, clock: &C) -> StatusSnapshot {
        StatusSnapshot {
            now: clock.now(),
            uptime: clock.uptime(),
            procedure: self
                .sequencer
                .current_state()
                .filter(|_| self.sequencer.is_active())
                .map(|state| (self.sequencer.kind(), state)),
            current_valve: if self.sequencer.is_active() {
                Some(self.sequencer.valve())
            } else {
                None
            },
            current_task: self.current_task,
            sensors: self.last_sensors,
            active_tasks: self
                .tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Active)
                .count(),
            total_tasks: self.tasks.len(),
            valve_statuses: *self.valves.statuses(),
            shutdown_allowed: self.allow_shutdown(),
            max_pressure: self.sequencer.max_pressure(),
        }
    }

    #[must_use]
    pub const fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    #[must_use]
    pub const fn valves(&self) -> &ValveBank {
        &self.valves
    }

    #[must_use]
    pub const fn events(&self) -> &EventLog {
        &self.log
    }

    #[must_use]
    pub const fn now_task(&self) -> &NowTaskRecord {
        &self.now_task
    }

    /// Updates the immediate-sample parameters.
    pub fn set_now_task_params(
        &mut self,
        params: PhaseParams,
    ) -> Result<(), ControlError<P::Error>> {
        self.now_task.params = params;
        self.persist_now_task()
    }

    #[must_use]
    pub const fn current_task(&self) -> Option<u32> {
        self.current_task
    }

    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub const fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Marks a valve as physically absent so it is never scheduled.
    pub fn set_valve_unavailable<C: Clock>(
        &mut self,
        valve: u8,
        clock: &C,
    ) -> Result<(), ControlError<P::Error>> {
        if !self.valves.contains(valve) {
            return Err(ScheduleError::ValveOutOfRange(valve).into());
        }
        self.set_valve_status(valve, ValveStatus::Unavailable, clock.uptime());
        self.persist_valves()
    }

    /// Returns a missed or unavailable valve to the free pool.
    pub fn reset_valve<C: Clock>(
        &mut self,
        valve: u8,
        clock: &C,
    ) -> Result<(), ControlError<P::Error>> {
        if !self.valves.contains(valve) {
            return Err(ScheduleError::ValveOutOfRange(valve).into());
        }
        let status = self.valves.status(valve);
        if status == ValveStatus::Operating {
            return Err(ControlError::Schedule(ScheduleError::ValveBusy {
                valve,
                status,
            }));
        }
        self.set_valve_status(valve, ValveStatus::Free, clock.uptime());
        self.persist_valves()
    }

    fn ensure_idle(&self) -> Result<(), BeginError> {
        if self.sequencer.is_active() || self.actions.is_scheduled(DELAYED_START) {
            return Err(BeginError::Busy);
        }
        Ok(())
    }

    fn wake_window_reached(&self, now: Timestamp) -> bool {
        self.tasks.iter().any(|task| {
            task.status == TaskStatus::Active
                && now.seconds_until(task.schedule) <= self.config.wake_window_secs
        })
    }

    fn launch_task<C: Clock>(
        &mut self,
        id: u32,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        let Some(task) = self.tasks.get(id) else {
            self.current_task = None;
            return Ok(());
        };
        let Some(valve) = task.current_valve() else {
            self.invalidate_missed_task(id, uptime)?;
            self.current_task = None;
            return Ok(());
        };
        let params = task.params;
        self.current_task = Some(id);
        self.set_valve_status(valve, ValveStatus::Operating, uptime);
        self.start_procedure(SequencerKind::Task, valve, &params, clock, sensors)?;
        self.persist_valves()?;
        Ok(())
    }

    fn start_procedure<C: Clock>(
        &mut self,
        kind: SequencerKind,
        valve: u8,
        params: &PhaseParams,
        clock: &mut C,
        sensors: SensorFrame,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        self.fault_handled = false;
        self.prevent_shutdown = true;
        self.actions.run_forever(
            DETAIL_LOG,
            uptime,
            self.config.detail_log_interval_ms,
            ControlEvent::DetailLog,
        )?;
        match self
            .sequencer
            .start(kind, valve, params, uptime, sensors, &mut self.driver)
        {
            Ok(signals) => self.handle_signals(&signals, clock),
            Err(error) => {
                self.handle_fault(error, clock)?;
                Err(ControlError::Sequence(error))
            }
        }
    }

    fn handle_signals<C: Clock>(
        &mut self,
        signals: &[SequencerSignal],
        clock: &mut C,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        for signal in signals {
            match *signal {
                SequencerSignal::EnteredState(state) => {
                    self.log.record(
                        EventKind::StateTransition {
                            kind: self.sequencer.kind(),
                            state,
                        },
                        uptime,
                    );
                }
                SequencerSignal::SampleExit {
                    cause,
                    max_pressure,
                } => {
                    self.log
                        .record(EventKind::SampleExit { cause, max_pressure }, uptime);
                }
                SequencerSignal::EnteredStop { sampled } => {
                    self.finish_run(sampled, clock)?;
                }
                SequencerSignal::EnteredIdle => {
                    self.schedule_next_active_task(clock, false)?;
                }
            }
        }
        Ok(())
    }

    /// Bookkeeping when a procedure reaches its stop state: valve
    /// disposition, task advance, and persistence, in that order.
    fn finish_run<C: Clock>(
        &mut self,
        sampled: bool,
        clock: &mut C,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        let now = clock.now();
        let kind = self.sequencer.kind();
        let valve = self.sequencer.valve();
        self.actions.cancel(DETAIL_LOG);

        match kind {
            SequencerKind::Task | SequencerKind::Now => {
                if sampled {
                    self.set_valve_status(valve, ValveStatus::Sampled, uptime);
                } else {
                    self.free_valve(valve, uptime);
                }
            }
            SequencerKind::HyperFlush => self.free_valve(valve, uptime),
            SequencerKind::Debubble => {}
        }

        if kind == SequencerKind::Task {
            if let Some(id) = self.current_task {
                let completed = self
                    .tasks
                    .get_mut(id)
                    .is_some_and(|task| task.advance(now));
                if completed {
                    self.log.record(
                        EventKind::TaskStatusChanged {
                            task: id,
                            status: TaskStatus::Completed,
                        },
                        uptime,
                    );
                    let discard = self
                        .tasks
                        .get(id)
                        .is_some_and(|task| task.delete_on_completion);
                    if discard {
                        let _ = self.tasks.delete(id);
                        self.log.record(EventKind::TaskDeleted { task: id }, uptime);
                    }
                }
                self.persist_tasks()?;
            }
        }
        if kind == SequencerKind::Now {
            self.now_task.valve = None;
            self.persist_now_task()?;
        }

        self.current_task = None;
        self.log
            .record(EventKind::ProcedureFinished { kind, sampled }, uptime);
        self.persist_valves()?;
        Ok(())
    }

    fn handle_fault<C: Clock>(
        &mut self,
        error: SequenceError,
        clock: &mut C,
    ) -> Result<(), ControlError<P::Error>> {
        let uptime = clock.uptime();
        self.fault_handled = true;
        self.actions.cancel(DETAIL_LOG);
        let kind = self.sequencer.kind();
        if kind != SequencerKind::Debubble {
            self.free_valve(self.sequencer.valve(), uptime);
        }
        self.current_task = None;
        self.prevent_shutdown = false;
        self.log.record(EventKind::SequenceFault { error }, uptime);
        self.persist_valves()?;
        Ok(())
    }

    /// Retires a task whose schedule has passed. The current valve is
    /// marked missed; later valves return to the free pool. A valve that
    /// already holds a sample keeps it.
    fn invalidate_missed_task(
        &mut self,
        id: u32,
        uptime: Millis,
    ) -> Result<(), ControlError<P::Error>> {
        let Some(task) = self.tasks.get_mut(id) else {
            return Ok(());
        };
        let current = task.current_valve();
        let mut remaining: Vec<u8, MAX_VALVES> = Vec::new();
        for &valve in task.remaining_valves() {
            let _ = remaining.push(valve);
        }
        task.mark_missed();
        self.log.record(
            EventKind::TaskStatusChanged {
                task: id,
                status: TaskStatus::Missed,
            },
            uptime,
        );

        for valve in remaining {
            if Some(valve) == current {
                if self.valves.status(valve) != ValveStatus::Sampled {
                    self.set_valve_status(valve, ValveStatus::Missed, uptime);
                }
            } else {
                self.free_valve(valve, uptime);
            }
        }
        self.persist_tasks()?;
        self.persist_valves()?;
        Ok(())
    }

    /// Completes a task at operator request and frees the valves it still
    /// holds. A valve in `keep` is left alone so the run that owns it can
    /// settle its final status.
    fn retire_task(
        &mut self,
        id: u32,
        keep: Option<u8>,
        uptime: Millis,
    ) -> Result<(), ControlError<P::Error>> {
        let Some(task) = self.tasks.get_mut(id) else {
            return Ok(());
        };
        let mut remaining: Vec<u8, MAX_VALVES> = Vec::new();
        for &valve in task.remaining_valves() {
            let _ = remaining.push(valve);
        }
        task.mark_completed();
        self.log.record(
            EventKind::TaskStatusChanged {
                task: id,
                status: TaskStatus::Completed,
            },
            uptime,
        );
        for valve in remaining {
            if Some(valve) != keep {
                self.free_valve(valve, uptime);
            }
        }
        self.persist_tasks()?;
        self.persist_valves()?;
        Ok(())
    }

    fn release_next_valve(&mut self, id: u32, uptime: Millis) {
        if let Some(valve) = self.tasks.get(id).and_then(|task| task.current_valve()) {
            self.free_valve(valve, uptime);
        }
    }

    fn set_valve_status(&mut self, valve: u8, status: ValveStatus, uptime: Millis) {
        self.valves.set_status(valve, status);
        self.log
            .record(EventKind::ValveStatusChanged { valve, status }, uptime);
    }

    fn free_valve(&mut self, valve: u8, uptime: Millis) {
        let before = self.valves.status(valve);
        self.valves.free_if_not_sampled(valve);
        let after = self.valves.status(valve);
        if before != after {
            self.log
                .record(EventKind::ValveStatusChanged { valve, status: after }, uptime);
        }
    }

    fn persist_tasks(&mut self) -> Result<(), ControlError<P::Error>> {
        self.persistence
            .save_tasks(self.tasks.records())
            .map_err(ControlError::Persist)
    }

    fn persist_valves(&mut self) -> Result<(), ControlError<P::Error>> {
        self.persistence
            .save_valves(self.valves.statuses())
            .map_err(ControlError::Persist)
    }

    fn persist_now_task(&mut self) -> Result<(), ControlError<P::Error>> {
        self.persistence
            .save_now_task(&self.now_task)
            .map_err(ControlError::Persist)
    }
}
