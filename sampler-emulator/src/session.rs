//! Interactive emulator session.
//!
//! Hosts the orchestration core against a simulated clock, driver, and a
//! crude fluid model: volume accumulates while the pump runs forward, and
//! line pressure climbs as the filter loads. Good enough to watch a full
//! sampling chain run at the console in simulated time.

use std::convert::Infallible;
use std::time::Duration;

use crossterm::style::Stylize;

use sampler_core::config::Config;
use sampler_core::controller::{ControlError, Controller, ScheduleCode};
use sampler_core::hardware::{
    ActuatorDriver, Clock, LineId, Persistence, PumpDrive, SensorFrame,
};
use sampler_core::repl::{parse, Command, ScheduleSpec, TaskCommand};
use sampler_core::tasks::{NowTaskRecord, TaskRecord};
use sampler_core::time::{Millis, Timestamp};
use sampler_core::valves::ValveStatus;
use sampler_core::{MAX_TASKS, MAX_VALVES};

const STEP_MS: u64 = 100;
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Liters added per step while the pump runs forward.
const FLOW_PER_STEP: f32 = 0.004;
/// PSI added per liter pushed through the filter.
const PRESSURE_PER_LITER: f32 = 1.5;
const BASE_PRESSURE: f32 = 1.2;

/// Simulated wall clock and RTC alarm.
struct SimClock {
    base_secs: i64,
    uptime: Millis,
    alarm: Option<Timestamp>,
}

impl SimClock {
    fn new(base_secs: i64) -> Self {
        Self {
            base_secs,
            uptime: Millis::ZERO,
            alarm: None,
        }
    }

    fn advance(&mut self, ms: u64) {
        self.uptime = Millis::from_millis(self.uptime.as_millis() + ms);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        let elapsed = i64::try_from(self.uptime.as_millis() / 1000).unwrap_or(i64::MAX);
        Timestamp::from_secs(self.base_secs.saturating_add(elapsed))
    }

    fn uptime(&self) -> Millis {
        self.uptime
    }

    fn schedule_alarm(&mut self, at: Timestamp) {
        self.alarm = Some(at);
    }
}

/// Actuator driver that just remembers its outputs.
struct SimDriver {
    pump: PumpDrive,
    intake: bool,
    lines: Vec<LineId>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self {
            pump: PumpDrive::Off,
            intake: false,
            lines: Vec::new(),
        }
    }
}

impl ActuatorDriver for SimDriver {
    fn pump(&mut self, drive: PumpDrive) {
        self.pump = drive;
    }

    fn intake(&mut self, enabled: bool) {
        self.intake = enabled;
    }

    fn open_lines(&mut self, lines: &[LineId]) {
        self.lines = lines.to_vec();
    }

    fn release_all(&mut self) {
        self.pump = PumpDrive::Off;
        self.intake = false;
        self.lines.clear();
    }
}

/// Keeps the last persisted records and counts writes.
#[derive(Default)]
struct MemoryPersistence {
    task_saves: usize,
    valve_saves: usize,
    now_saves: usize,
}

impl Persistence for MemoryPersistence {
    type Error = Infallible;

    fn save_tasks(
        &mut self,
        _tasks: &heapless::Vec<TaskRecord, MAX_TASKS>,
    ) -> Result<(), Infallible> {
        self.task_saves += 1;
        Ok(())
    }

    fn save_valves(&mut self, _statuses: &[ValveStatus; MAX_VALVES]) -> Result<(), Infallible> {
        self.valve_saves += 1;
        Ok(())
    }

    fn save_now_task(&mut self, _record: &NowTaskRecord) -> Result<(), Infallible> {
        self.now_saves += 1;
        Ok(())
    }
}

pub struct Session {
    controller: Controller<SimDriver, MemoryPersistence>,
    clock: SimClock,
    volume: f32,
    pressure: f32,
    rendered_events: u32,
}

impl Session {
    pub fn new(seed: u64) -> Self {
        Self {
            controller: Controller::new(
                SimDriver::default(),
                MemoryPersistence::default(),
                Config::default(),
                seed,
            ),
            clock: SimClock::new(1_700_000_000),
            volume: 0.0,
            pressure: BASE_PRESSURE,
            rendered_events: 0,
        }
    }

    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        match parse(line) {
            Ok(command) => self.dispatch(command),
            Err(error) => vec![format!("{}", format!("parse error: {error}").red())],
        }
    }

    fn dispatch(&mut self, command: Command<'_>) -> Vec<String> {
        match command {
            Command::Status => self.render_status(),
            Command::Valves => self.render_valves(),
            Command::Tasks => self.render_tasks(),
            Command::Events => self.render_events(),
            Command::Task(task) => self.dispatch_task(task),
            Command::HyperFlush => {
                let sensors = self.sensor_frame();
                match self
                    .controller
                    .begin_hyper_flush(&mut self.clock, sensors)
                {
                    Ok(valve) => vec![format!(
                        "{} preloading valve {valve}",
                        "hyper flush started,".green()
                    )],
                    Err(error) => vec![render_error(&error)],
                }
            }
            Command::Debubble => {
                let sensors = self.sensor_frame();
                match self.controller.begin_debubble(&mut self.clock, sensors) {
                    Ok(()) => vec![format!("{}", "debubble started".green())],
                    Err(error) => vec![render_error(&error)],
                }
            }
            Command::Now { valve } => {
                let sensors = self.sensor_frame();
                match self
                    .controller
                    .begin_now_task(valve, &mut self.clock, sensors)
                {
                    Ok(valve) => vec![format!(
                        "{} on valve {valve}",
                        "immediate sample started".green()
                    )],
                    Err(error) => vec![render_error(&error)],
                }
            }
            Command::Tick { duration } => self.run_for(duration.unwrap_or(DEFAULT_TICK)),
            Command::Help => render_help(),
        }
    }

    fn dispatch_task(&mut self, command: TaskCommand<'_>) -> Vec<String> {
        match command {
            TaskCommand::Create { name } => {
                match self.controller.create_task(name, &self.clock) {
                    Ok(id) => vec![format!("created task {id} `{name}`")],
                    Err(error) => vec![render_error(&error)],
                }
            }
            TaskCommand::Show { id } => match self.controller.tasks().get(id) {
                Some(task) => render_task_detail(task),
                None => vec![format!("{}", "no such task".red())],
            },
            TaskCommand::Delete { id } => {
                match self.controller.delete_task(id, &mut self.clock) {
                    Ok(()) => vec![format!("deleted task {id}")],
                    Err(error) => vec![render_error(&error)],
                }
            }
            TaskCommand::Valves { id, valves } => {
                match self.controller.set_task_valves(id, &valves) {
                    Ok(()) => vec![format!("task {id} now claims {:?}", valves.as_slice())],
                    Err(error) => vec![render_error(&error)],
                }
            }
            TaskCommand::Schedule { id, at } => {
                let at = match at {
                    ScheduleSpec::At(secs) => Timestamp::from_secs(secs),
                    ScheduleSpec::In(duration) => {
                        self.clock.now()
                            + i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
                    }
                };
                match self.controller.schedule_task(id, at, &mut self.clock) {
                    Ok(code) => vec![format!(
                        "task {id} scheduled for {at} ({})",
                        render_code(code)
                    )],
                    Err(error) => vec![render_error(&error)],
                }
            }
            TaskCommand::Unschedule { id } => {
                match self.controller.unschedule_task(id, &mut self.clock) {
                    Ok(()) => vec![format!("task {id} unscheduled")],
                    Err(error) => vec![render_error(&error)],
                }
            }
        }
    }

    /// Steps simulated time forward, feeding the fluid model to the core.
    fn run_for(&mut self, duration: Duration) -> Vec<String> {
        let mut output = Vec::new();
        let total_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let mut stepped = 0;

        while stepped < total_ms {
            self.clock.advance(STEP_MS);
            stepped += STEP_MS;

            if let Some(alarm) = self.clock.alarm {
                if self.clock.now() >= alarm {
                    self.clock.alarm = None;
                    if let Err(error) = self.controller.on_wake(&mut self.clock) {
                        output.push(render_error(&error));
                    }
                }
            }

            self.advance_fluids();
            let sensors = self.sensor_frame();
            if let Err(error) = self.controller.tick(&mut self.clock, sensors) {
                output.push(render_error(&error));
            }
        }

        output.extend(self.render_new_events());
        output.push(format!(
            "advanced {total_ms}ms to {} (uptime {})",
            self.clock.now(),
            self.clock.uptime()
        ));
        output
    }

    fn advance_fluids(&mut self) {
        let driver = self.controller.driver();
        match driver.pump {
            PumpDrive::Forward if !driver.lines.is_empty() => {
                self.volume += FLOW_PER_STEP;
                self.pressure = BASE_PRESSURE + self.volume * PRESSURE_PER_LITER;
            }
            PumpDrive::Reverse => {
                self.pressure = (self.pressure - 0.05).max(BASE_PRESSURE);
            }
            _ => {}
        }
    }

    fn sensor_frame(&self) -> SensorFrame {
        SensorFrame {
            volume: self.volume,
            pressure: self.pressure,
            temperature: 11.5,
            barometric: 1.01,
        }
    }

    fn render_status(&mut self) -> Vec<String> {
        let snapshot = self.controller.snapshot(&self.clock);
        let mut output = vec![format!("{}", "sampler status".bold())];
        output.push(format!(
            "  time {} (uptime {})",
            snapshot.now, snapshot.uptime
        ));
        match (snapshot.procedure, snapshot.current_valve) {
            (Some((kind, state)), Some(valve)) => {
                output.push(format!("  running {kind}: {state} on valve {valve}"));
            }
            _ => output.push("  no procedure running".to_string()),
        }
        output.push(format!(
            "  sensors {:.2}L at {:.2}psi, {:.1}C",
            snapshot.sensors.volume, snapshot.sensors.pressure, snapshot.sensors.temperature
        ));
        match snapshot.current_task {
            Some(id) => output.push(format!("  current task {id}")),
            None => output.push("  no task armed".to_string()),
        }
        output.push(format!(
            "  tasks {} active / {} total",
            snapshot.active_tasks, snapshot.total_tasks
        ));
        output.push(format!(
            "  valves {} free, {} sampled",
            snapshot.free_valves(),
            snapshot.sampled_valves()
        ));
        output.push(format!(
            "  shutdown {}",
            if snapshot.shutdown_allowed {
                "allowed".green()
            } else {
                "held".yellow()
            }
        ));
        if let Some(alarm) = self.clock.alarm {
            output.push(format!("  wake alarm at {alarm}"));
        }
        let persistence = self.controller.persistence();
        output.push(format!(
            "  persisted: {} task writes, {} valve writes",
            persistence.task_saves, persistence.valve_saves
        ));
        output
    }

    fn render_valves(&self) -> Vec<String> {
        let mut output = vec![format!("{}", "valves".bold())];
        for (index, status) in self.controller.valves().statuses().iter().enumerate() {
            if *status == ValveStatus::Free {
                continue;
            }
            let valve = u8::try_from(index).unwrap_or(u8::MAX);
            let group = self.controller.valves().group(valve);
            if group.is_empty() {
                output.push(format!("  valve {index}: {status}"));
            } else {
                output.push(format!("  valve {index} ({group}): {status}"));
            }
        }
        if output.len() == 1 {
            output.push("  all valves free".to_string());
        }
        output
    }

    fn render_tasks(&self) -> Vec<String> {
        let mut output = vec![format!("{}", "tasks".bold())];
        for task in self.controller.tasks().iter() {
            output.push(format!(
                "  {} `{}` {} schedule {} valves {:?} next #{}",
                task.id,
                task.name,
                task.status,
                task.schedule,
                task.valves.as_slice(),
                task.valve_offset,
            ));
        }
        if output.len() == 1 {
            output.push("  no tasks".to_string());
        }
        output
    }

    fn render_events(&mut self) -> Vec<String> {
        let mut output = vec![format!("{}", "events".bold())];
        for record in self.controller.events().oldest_first() {
            output.push(format!("  [{}] {} {}", record.id, record.at, record.kind));
        }
        if output.len() == 1 {
            output.push("  no events yet".to_string());
        }
        if let Some(latest) = self.controller.events().latest() {
            self.rendered_events = latest.id.wrapping_add(1);
        }
        output
    }

    /// Events recorded since the last render, shown after each `tick`.
    fn render_new_events(&mut self) -> Vec<String> {
        let mut output = Vec::new();
        for record in self.controller.events().oldest_first() {
            if record.id >= self.rendered_events {
                output.push(format!("  [{}] {} {}", record.id, record.at, record.kind));
            }
        }
        if let Some(latest) = self.controller.events().latest() {
            self.rendered_events = latest.id.wrapping_add(1);
        }
        output
    }
}

fn render_error<PE: std::fmt::Debug>(error: &ControlError<PE>) -> String {
    format!("{}", format!("error: {error}").red())
}

fn render_code(code: ScheduleCode) -> &'static str {
    match code {
        ScheduleCode::Unavailable => "nothing runnable",
        ScheduleCode::Operating => "armed to run",
        ScheduleCode::Scheduled => "alarm set",
    }
}

fn render_task_detail(task: &TaskRecord) -> Vec<String> {
    vec![
        format!("task {} `{}`", task.id, task.name),
        format!("  status {}  schedule {}", task.status, task.schedule),
        format!(
            "  valves {:?} (next #{})  every {}s",
            task.valves.as_slice(),
            task.valve_offset,
            task.time_between
        ),
        format!(
            "  flush {}s/{}L  sample {}s/{}L@{}psi  dry {}s  preserve {}s",
            task.params.flush_time,
            task.params.flush_volume,
            task.params.sample_time,
            task.params.sample_volume,
            task.params.sample_pressure,
            task.params.dry_time,
            task.params.preserve_time
        ),
        if task.notes.is_empty() {
            "  no notes".to_string()
        } else {
            format!("  notes: {}", task.notes)
        },
    ]
}

fn render_help() -> Vec<String> {
    [
        "status                          show controller state",
        "valves                          list claimed valves",
        "tasks                           list tasks",
        "events                          dump the event log",
        "task create <name>              create a draft task",
        "task show <id>                  show one task",
        "task delete <id>                delete a task",
        "task valves <id> <v1,v2,...>    claim valves for a task",
        "task schedule <id> <time|dur>   activate a task (epoch secs or e.g. 90s)",
        "task unschedule <id>            deactivate a task",
        "now [valve]                     run an immediate sample",
        "hyperflush                      run the high-volume flush",
        "debubble                        purge air with alcohol",
        "tick [duration]                 advance simulated time (default 1s)",
        "exit                            quit",
    ]
    .iter()
    .map(|line| (*line).to_string())
    .collect()
}
