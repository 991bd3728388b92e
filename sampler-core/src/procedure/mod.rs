//! Procedure sequencer.
//!
//! Interprets a configured chain of states against the actuator driver. The
//! interpreter is table driven: each state's behavior lives in its
//! [`StateSpec`] and successor lookup goes through the chain's transition
//! table, so there is no per-state dispatch code. Within a phase the timing
//! is fixed: lines settle before the pump starts, and line state is
//! reasserted about once a second against relay glitches.

pub mod chains;

use core::fmt;

use heapless::Vec;

pub use chains::{
    debubble_chain, hyper_flush_chain, sampling_chain, PhaseSpec, SequencerKind, StateName,
    StateNode, StateSpec, EXIT_TIME, EXIT_VOLUME, MAX_CHAIN,
};

use crate::actions::ActionScheduler;
use crate::hardware::{ActuatorDriver, PumpDrive, SensorFrame};
use crate::tasks::PhaseParams;
use crate::time::Millis;

/// Seconds between entering a phase and opening its lines.
pub const LINE_SETTLE_SECS: u64 = 5;

/// Seconds between entering a phase and starting the pump.
pub const PUMP_DELAY_SECS: u64 = 6;

/// Interval at which line state is reasserted, in milliseconds.
pub const REASSERT_INTERVAL_MS: u64 = 1000;

/// Maximum signals one tick can produce.
pub const MAX_SIGNALS: usize = 6;

/// Why a metered phase exited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitCause {
    TimeExpired,
    VolumeReached,
    PressureReached,
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitCause::TimeExpired => "time expired",
            ExitCause::VolumeReached => "volume reached",
            ExitCause::PressureReached => "pressure limit",
        };
        f.write_str(text)
    }
}

/// Fatal sequencing faults. Once raised, the sequencer stays faulted until
/// it is restarted; the owner is expected to release hardware and log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequenceError {
    /// A state emitted an exit code its transition table does not map.
    UnmappedTransition { state: StateName, code: u8 },
    /// A transition names a state the chain does not contain.
    UnknownState(StateName),
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceError::UnmappedTransition { state, code } => {
                write!(f, "state {state} has no transition for exit code {code}")
            }
            SequenceError::UnknownState(state) => {
                write!(f, "chain does not contain state {state}")
            }
        }
    }
}

/// Observable sequencer progress, consumed by the owning controller.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SequencerSignal {
    EnteredState(StateName),
    /// A metered phase exited, with the recorded cause and peak pressure.
    SampleExit { cause: ExitCause, max_pressure: f32 },
    /// The stop state ran. `sampled` is `true` when the sample phase
    /// finished during this run.
    EnteredStop { sampled: bool },
    EnteredIdle,
}

/// Deferred work within a phase state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StagedOp {
    OpenLines,
    PumpOn,
    PumpOff,
    Reassert,
    Exit(u8),
}

/// Table-driven chain interpreter. One instance exists per controller; it is
/// reconfigured for each run rather than shared.
pub struct Sequencer {
    kind: SequencerKind,
    valve: u8,
    nodes: Vec<StateNode, MAX_CHAIN>,
    current: Option<usize>,
    active: bool,
    fault: Option<SequenceError>,
    staged: ActionScheduler<StagedOp, 8>,
    entered_at: Millis,
    flow_base: f32,
    max_pressure: f32,
    sample_completed: bool,
}

impl Sequencer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: SequencerKind::Task,
            valve: 0,
            nodes: Vec::new(),
            current: None,
            active: false,
            fault: None,
            staged: ActionScheduler::new(),
            entered_at: Millis::ZERO,
            flow_base: 0.0,
            max_pressure: 0.0,
            sample_completed: false,
        }
    }

    /// Configures the chain for `kind` and enters its first state.
    pub fn start<D: ActuatorDriver>(
        &mut self,
        kind: SequencerKind,
        valve: u8,
        params: &PhaseParams,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
    ) -> Result<Vec<SequencerSignal, MAX_SIGNALS>, SequenceError> {
        let nodes = match kind {
            SequencerKind::Task | SequencerKind::Now => sampling_chain(valve, params),
            SequencerKind::HyperFlush => hyper_flush_chain(valve, params),
            SequencerKind::Debubble => debubble_chain(params),
        };
        self.start_with_nodes(kind, valve, nodes, uptime, sensors, driver)
    }

    /// Starts an explicitly provided chain. Exposed for host tooling that
    /// assembles custom maintenance chains.
    pub fn start_with_nodes<D: ActuatorDriver>(
        &mut self,
        kind: SequencerKind,
        valve: u8,
        nodes: Vec<StateNode, MAX_CHAIN>,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
    ) -> Result<Vec<SequencerSignal, MAX_SIGNALS>, SequenceError> {
        self.kind = kind;
        self.valve = valve;
        self.nodes = nodes;
        self.current = None;
        self.active = true;
        self.fault = None;
        self.staged.clear();
        self.sample_completed = false;
        self.max_pressure = 0.0;

        let mut signals = Vec::new();
        if let Err(error) = self.enter(0, uptime, sensors, driver, &mut signals) {
            self.latch_fault(error, driver);
            return Err(error);
        }
        Ok(signals)
    }

    /// Advances the active procedure by one control tick.
    pub fn tick<D: ActuatorDriver>(
        &mut self,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
    ) -> Result<Vec<SequencerSignal, MAX_SIGNALS>, SequenceError> {
        let mut signals = Vec::new();
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        if !self.active {
            return Ok(signals);
        }
        let Some(current) = self.current else {
            return Ok(signals);
        };

        // Polled early exits run before staged ops so a reached limit wins
        // over a time expiry landing on the same tick.
        let polled_exit = self.poll_exit(current, uptime, sensors);
        if let Some((code, cause)) = polled_exit {
            if let Err(error) =
                self.exit_state(current, code, Some(cause), uptime, sensors, driver, &mut signals)
            {
                self.latch_fault(error, driver);
                return Err(error);
            }
            return Ok(signals);
        }

        let mut ops: Vec<StagedOp, 8> = Vec::new();
        self.staged.tick(uptime, &mut ops);
        for op in ops {
            match op {
                StagedOp::OpenLines | StagedOp::Reassert => self.assert_lines(driver),
                StagedOp::PumpOn => {
                    if let Some(StateSpec::Phase(spec)) =
                        self.current.map(|i| &self.nodes[i].spec)
                    {
                        driver.pump(spec.pump);
                    }
                }
                StagedOp::PumpOff => driver.pump(PumpDrive::Off),
                StagedOp::Exit(code) => {
                    if let Err(error) =
                        self.exit_state(current, code, None, uptime, sensors, driver, &mut signals)
                    {
                        self.latch_fault(error, driver);
                        return Err(error);
                    }
                    // The new state replaced the staged table.
                    break;
                }
            }
        }
        Ok(signals)
    }

    /// Stops the run immediately and releases the hardware.
    pub fn abort<D: ActuatorDriver>(&mut self, driver: &mut D) {
        driver.release_all();
        self.staged.clear();
        self.current = None;
        self.active = false;
    }

    /// Cuts the run short by jumping to the chain's stop state, so the owner
    /// sees the same [`SequencerSignal::EnteredStop`] disposition a natural
    /// finish produces. A no-op when nothing is running.
    pub fn stop<D: ActuatorDriver>(
        &mut self,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
    ) -> Result<Vec<SequencerSignal, MAX_SIGNALS>, SequenceError> {
        let mut signals = Vec::new();
        if !self.active {
            return Ok(signals);
        }
        let Some(stop_index) = self
            .nodes
            .iter()
            .position(|node| matches!(node.spec, StateSpec::Stop))
        else {
            let error = SequenceError::UnknownState(StateName::Stop);
            self.latch_fault(error, driver);
            return Err(error);
        };
        if let Err(error) = self.enter(stop_index, uptime, sensors, driver, &mut signals) {
            self.latch_fault(error, driver);
            return Err(error);
        }
        Ok(signals)
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn current_state(&self) -> Option<StateName> {
        self.current.map(|index| self.nodes[index].name)
    }

    #[must_use]
    pub const fn kind(&self) -> SequencerKind {
        self.kind
    }

    #[must_use]
    pub const fn valve(&self) -> u8 {
        self.valve
    }

    #[must_use]
    pub const fn max_pressure(&self) -> f32 {
        self.max_pressure
    }

    #[must_use]
    pub const fn fault(&self) -> Option<SequenceError> {
        self.fault
    }

    fn latch_fault<D: ActuatorDriver>(&mut self, error: SequenceError, driver: &mut D) {
        driver.release_all();
        self.staged.clear();
        self.active = false;
        self.fault = Some(error);
    }

    fn poll_exit(
        &mut self,
        current: usize,
        uptime: Millis,
        sensors: SensorFrame,
    ) -> Option<(u8, ExitCause)> {
        let StateSpec::Phase(spec) = &self.nodes[current].spec else {
            return None;
        };
        if spec.meter_flow {
            self.max_pressure = self.max_pressure.max(sensors.pressure);
        }
        // Limits only apply once the pump has started.
        let running_ms = uptime.as_millis().saturating_sub(self.entered_at.as_millis());
        if running_ms < PUMP_DELAY_SECS * 1000 {
            return None;
        }
        if let Some(target) = spec.volume_target {
            if sensors.volume - self.flow_base >= target {
                return Some((EXIT_VOLUME, ExitCause::VolumeReached));
            }
        }
        if let Some(cutoff) = spec.pressure_cutoff {
            if sensors.pressure >= cutoff {
                return Some((EXIT_TIME, ExitCause::PressureReached));
            }
        }
        None
    }

    fn assert_lines<D: ActuatorDriver>(&self, driver: &mut D) {
        if let Some(StateSpec::Phase(spec)) = self.current.map(|i| &self.nodes[i].spec) {
            driver.open_lines(&spec.lines);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exit_state<D: ActuatorDriver>(
        &mut self,
        current: usize,
        code: u8,
        cause: Option<ExitCause>,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
        signals: &mut Vec<SequencerSignal, MAX_SIGNALS>,
    ) -> Result<(), SequenceError> {
        let leaving = &self.nodes[current];
        if let StateSpec::Phase(spec) = &leaving.spec {
            if spec.collects_sample {
                self.sample_completed = true;
            }
            if spec.meter_flow {
                push_signal(
                    signals,
                    SequencerSignal::SampleExit {
                        cause: cause.unwrap_or(ExitCause::TimeExpired),
                        max_pressure: self.max_pressure,
                    },
                );
            }
        }
        let next = self.transition_target(current, code)?;
        self.enter(next, uptime, sensors, driver, signals)
    }

    fn transition_target(&self, from: usize, code: u8) -> Result<usize, SequenceError> {
        let state = &self.nodes[from];
        let next_name = state
            .transitions
            .iter()
            .find(|(mapped, _)| *mapped == code)
            .map(|(_, next)| *next)
            .ok_or(SequenceError::UnmappedTransition {
                state: state.name,
                code,
            })?;
        self.nodes
            .iter()
            .position(|node| node.name == next_name)
            .ok_or(SequenceError::UnknownState(next_name))
    }

    fn enter<D: ActuatorDriver>(
        &mut self,
        mut index: usize,
        uptime: Millis,
        sensors: SensorFrame,
        driver: &mut D,
        signals: &mut Vec<SequencerSignal, MAX_SIGNALS>,
    ) -> Result<(), SequenceError> {
        loop {
            self.current = Some(index);
            self.entered_at = uptime;
            self.staged.clear();
            let name = self.nodes[index].name;
            let spec = self.nodes[index].spec.clone();
            push_signal(signals, SequencerSignal::EnteredState(name));
            match spec {
                StateSpec::Phase(phase) => {
                    driver.open_lines(&[]);
                    driver.pump(PumpDrive::Off);
                    driver.intake(phase.intake);
                    if phase.meter_flow {
                        self.flow_base = sensors.volume;
                        self.max_pressure = 0.0;
                    }
                    self.stage_phase(&phase, uptime);
                    return Ok(());
                }
                StateSpec::Stop => {
                    driver.release_all();
                    push_signal(
                        signals,
                        SequencerSignal::EnteredStop {
                            sampled: self.sample_completed,
                        },
                    );
                    index = self.transition_target(index, EXIT_TIME)?;
                }
                StateSpec::Idle => {
                    push_signal(signals, SequencerSignal::EnteredIdle);
                    self.active = false;
                    return Ok(());
                }
            }
        }
    }

    fn stage_phase(&mut self, phase: &PhaseSpec, uptime: Millis) {
        let duration_ms = u64::try_from(phase.duration_secs.max(0)).unwrap_or(0) * 1000;
        let exit_base_ms = duration_ms + PUMP_DELAY_SECS * 1000;
        let staged = &mut self.staged;
        // Capacity 8 covers the five fixed entries.
        let _ = staged.run_once("open-lines", uptime, LINE_SETTLE_SECS * 1000, StagedOp::OpenLines);
        let _ = staged.run_once("pump-on", uptime, PUMP_DELAY_SECS * 1000, StagedOp::PumpOn);
        let _ = staged.run_forever("reassert", uptime, REASSERT_INTERVAL_MS, StagedOp::Reassert);
        if phase.pump_off_before_exit {
            let _ = staged.run_once("pump-off", uptime, exit_base_ms, StagedOp::PumpOff);
            let _ = staged.run_once("exit", uptime, exit_base_ms + 1000, StagedOp::Exit(EXIT_TIME));
        } else {
            let _ = staged.run_once("exit", uptime, exit_base_ms, StagedOp::Exit(EXIT_TIME));
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

fn push_signal(signals: &mut Vec<SequencerSignal, MAX_SIGNALS>, signal: SequencerSignal) {
    let pushed = signals.push(signal).is_ok();
    debug_assert!(pushed, "signal buffer overflow");
}
