//! Procedure chain templates.
//!
//! A chain is a list of named states plus a transition table mapping exit
//! codes to successor states. Every chain funnels into `Stop` and then
//! `Idle`; a transition code with no mapping is a wiring fault and surfaces
//! as [`SequenceError::UnmappedTransition`](super::SequenceError).
use crate::hardware::{LineId, PumpDrive, MAX_OPEN_LINES};
use crate::tasks::PhaseParams;
use core::fmt;
use heapless::Vec;
/// Maximum states in one chain.
pub const MAX_CHAIN: usize = 12;
/// Maximum transition mappings per state.
pub const MAX_TRANSITIONS: usize = 2;
/// Normal exit code emitted when a phase runs its full duration.
pub const EXIT_TIME: u8 = 0;
/// Exit code emitted when a phase reaches its volume target early.
pub const EXIT_VOLUME: u8 = 1;
/// Which procedure a sequencer run belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequencerKind {
    /// Scheduled task run through the full sampling chain.
    Task,
    /// Operator-initiated immediate sample.
    Now,
    /// High-volume flush used after deployment or maintenance.
    HyperFlush,
    /// Alcohol purge to clear air bubbles from the lines.
    Debubble,
}
impl fmt::Display for SequencerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SequencerKind::Task => "task procedure",
            SequencerKind::Now => "immediate sample",
            SequencerKind::HyperFlush => "hyper flush",
            SequencerKind::Debubble => "debubble",
        };
        f.write_str(text)
    }
}
/// Names of every state any chain can visit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateName {
    Flush1,
    OffshootClean1,
    Flush2,
    Sample,
    OffshootClean2,
    Dry,
    Preserve,
    AirFlush,
    AlcoholPurge,
    OffshootPreload,
    Stop,
    Idle,
}
impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StateName::Flush1 => "flush",
            StateName::OffshootClean1 => "offshoot-clean",
            StateName::Flush2 => "flush-2",
            StateName::Sample => "sample",
            StateName::OffshootClean2 => "offshoot-clean-2",
            StateName::Dry => "dry",
            StateName::Preserve => "preserve",
            StateName::AirFlush => "air-flush",
            StateName::AlcoholPurge => "alcohol-purge",
            StateName::OffshootPreload => "offshoot-preload",
            StateName::Stop => "stop",
            StateName::Idle => "idle",
        };
        f.write_str(text)
    }
}
/// Behavior of a single phase state, fully resolved at configure time.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSpec {
    pub duration_secs: i64,
    pub pump: PumpDrive,
    pub intake: bool,
    pub lines: Vec<LineId, MAX_OPEN_LINES>,
    /// Polled early-exit on accumulated volume, emitting [`EXIT_VOLUME`].
    pub volume_target: Option<f32>,
    /// Polled early-exit on line pressure.
    pub pressure_cutoff: Option<f32>,
    /// Whether this phase meters flow against the task's sample volume.
    pub meter_flow: bool,
    /// Whether finishing this phase leaves collected water in the offshoot.
    pub collects_sample: bool,
    /// Stops the pump one second before exiting, letting pressure bleed off.
    pub pump_off_before_exit: bool,
}
/// What a state does while active.
#[derive(Clone, Debug, PartialEq)]
pub enum StateSpec {
    Phase(PhaseSpec),
    Stop,
    Idle,
}
/// One state in a configured chain.
#[derive(Clone, Debug, PartialEq)]
pub struct StateNode {
    pub name: StateName,
    pub spec: StateSpec,
    pub transitions: Vec<(u8, StateName), MAX_TRANSITIONS>,
}
fn lines(ids: &[LineId]) -> Vec<LineId, MAX_OPEN_LINES> {
    Vec::from_slice(ids).unwrap_or_default()
}
fn node(name: StateName, spec: StateSpec, transitions: &[(u8, StateName)]) -> StateNode {
    StateNode {
        name,
        spec,
        transitions: Vec::from_slice(transitions).unwrap_or_default(),
    }
}
fn flush(name: StateName, next: StateName, time: i64) -> StateNode {
    node(
        name,
        StateSpec::Phase(PhaseSpec {
            duration_secs: time,
            pump: PumpDrive::Forward,
            intake: true,
            lines: lines(&[LineId::Flush]),
            volume_target: None,
            pressure_cutoff: None,
            meter_flow: false,
            collects_sample: false,
            pump_off_before_exit: false,
        }),
        &[(EXIT_TIME, next)],
    )
}
fn offshoot_clean(name: StateName, next: StateName, time: i64, valve: u8) -> StateNode {
    node(
        name,
        StateSpec::Phase(PhaseSpec {
            duration_secs: time,
            pump: PumpDrive::Reverse,
            intake: true,
            lines: lines(&[LineId::Offshoot(valve)]),
            volume_target: None,
            pressure_cutoff: None,
            meter_flow: false,
            collects_sample: false,
            pump_off_before_exit: true,
        }),
        &[(EXIT_TIME, next)],
    )
}
/// Builds the full sampling chain for a scheduled or immediate run.
#[must_use]
pub fn sampling_chain(valve: u8, params: &PhaseParams) -> Vec<StateNode, MAX_CHAIN> {
    let clean_time = params.flush_time.min(20);
    let mut chain = Vec::new();
    let nodes = [
        flush(
            StateName::Flush1,
            StateName::OffshootClean1,
            params.flush_time,
        ),
        offshoot_clean(
            StateName::OffshootClean1,
            StateName::Flush2,
            clean_time,
            valve,
        ),
        flush(StateName::Flush2, StateName::Sample, params.flush_time),
        node(
            StateName::Sample,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.sample_time,
                pump: PumpDrive::Forward,
                intake: true,
                lines: lines(&[LineId::Offshoot(valve)]),
                volume_target: Some(params.sample_volume),
                pressure_cutoff: Some(params.sample_pressure),
                meter_flow: true,
                collects_sample: true,
                pump_off_before_exit: false,
            }),
            &[
                (EXIT_TIME, StateName::OffshootClean2),
                (EXIT_VOLUME, StateName::OffshootClean2),
            ],
        ),
        offshoot_clean(StateName::OffshootClean2, StateName::Dry, clean_time, valve),
        node(
            StateName::Dry,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.dry_time,
                pump: PumpDrive::Forward,
                intake: false,
                lines: lines(&[LineId::Air, LineId::Offshoot(valve)]),
                volume_target: None,
                pressure_cutoff: None,
                meter_flow: false,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[(EXIT_TIME, StateName::Preserve)],
        ),
        node(
            StateName::Preserve,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.preserve_time,
                pump: PumpDrive::Forward,
                intake: false,
                lines: lines(&[LineId::Alcohol, LineId::Offshoot(valve)]),
                volume_target: None,
                pressure_cutoff: None,
                meter_flow: false,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[(EXIT_TIME, StateName::AirFlush)],
        ),
        node(
            StateName::AirFlush,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.dry_time,
                pump: PumpDrive::Forward,
                intake: false,
                lines: lines(&[LineId::Air, LineId::Flush]),
                volume_target: None,
                pressure_cutoff: None,
                meter_flow: false,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[(EXIT_TIME, StateName::Stop)],
        ),
        node(
            StateName::Stop,
            StateSpec::Stop,
            &[(EXIT_TIME, StateName::Idle)],
        ),
        node(StateName::Idle, StateSpec::Idle, &[]),
    ];
    for n in nodes {
        // MAX_CHAIN covers the longest chain.
        let _ = chain.push(n);
    }
    chain
}
/// Builds the hyper flush chain: a volume-limited flush followed by an
/// offshoot preload.
#[must_use]
pub fn hyper_flush_chain(valve: u8, params: &PhaseParams) -> Vec<StateNode, MAX_CHAIN> {
    let mut chain = Vec::new();
    let nodes = [
        node(
            StateName::Flush1,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.flush_time,
                pump: PumpDrive::Forward,
                intake: true,
                lines: lines(&[LineId::Flush]),
                volume_target: Some(params.flush_volume),
                pressure_cutoff: None,
                meter_flow: true,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[
                (EXIT_TIME, StateName::OffshootPreload),
                (EXIT_VOLUME, StateName::OffshootPreload),
            ],
        ),
        node(
            StateName::OffshootPreload,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.preserve_time,
                pump: PumpDrive::Forward,
                intake: true,
                lines: lines(&[LineId::Offshoot(valve)]),
                volume_target: None,
                pressure_cutoff: None,
                meter_flow: false,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[(EXIT_TIME, StateName::Stop)],
        ),
        node(
            StateName::Stop,
            StateSpec::Stop,
            &[(EXIT_TIME, StateName::Idle)],
        ),
        node(StateName::Idle, StateSpec::Idle, &[]),
    ];
    for n in nodes {
        let _ = chain.push(n);
    }
    chain
}
/// Builds the debubble chain: a single alcohol purge.
#[must_use]
pub fn debubble_chain(params: &PhaseParams) -> Vec<StateNode, MAX_CHAIN> {
    let mut chain = Vec::new();
    let nodes = [
        node(
            StateName::AlcoholPurge,
            StateSpec::Phase(PhaseSpec {
                duration_secs: params.preserve_time,
                pump: PumpDrive::Forward,
                intake: false,
                lines: lines(&[LineId::Alcohol, LineId::Flush]),
                volume_target: None,
                pressure_cutoff: None,
                meter_flow: false,
                collects_sample: false,
                pump_off_before_exit: false,
            }),
            &[(EXIT_TIME, StateName::Stop)],
        ),
        node(
            StateName::Stop,
            StateSpec::Stop,
            &[(EXIT_TIME, StateName::Idle)],
        ),
        node(StateName::Idle, StateSpec::Idle, &[]),
    ];
    for n in nodes {
        let _ = chain.push(n);
    }
    chain
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn sampling_chain_ends_in_stop_then_idle() {
        let chain = sampling_chain(2, &PhaseParams::default());
        let names: heapless::Vec<StateName, MAX_CHAIN> = chain.iter().map(|n| n.name).collect();
        assert_eq!(names.first(), Some(&StateName::Flush1));
        assert_eq!(
            &names[names.len() - 2..],
            &[StateName::Stop, StateName::Idle]
        );
    }
    #[test]
    fn sample_state_exits_on_time_or_volume() {
        let chain = sampling_chain(0, &PhaseParams::default());
        let sample = chain
            .iter()
            .find(|n| n.name == StateName::Sample)
            .expect("sampling chain includes a sample state");
        assert!(sample
            .transitions
            .iter()
            .any(|(code, _)| *code == EXIT_VOLUME));
    }
    #[test]
    fn only_the_sample_state_collects() {
        let params = PhaseParams::default();
        for chain in [
            sampling_chain(1, &params),
            hyper_flush_chain(1, &params),
            debubble_chain(&params),
        ] {
            for state in &chain {
                if let StateSpec::Phase(spec) = &state.spec {
                    assert_eq!(
                        spec.collects_sample,
                        state.name == StateName::Sample,
                        "{} phase mislabels sample collection",
                        state.name
                    );
                }
            }
        }
    }
    #[test]
    fn every_transition_targets_a_chain_member() {
        let params = PhaseParams::default();
        for chain in [
            sampling_chain(1, &params),
            hyper_flush_chain(1, &params),
            debubble_chain(&params),
        ] {
            for state in &chain {
                for (_, next) in &state.transitions {
                    assert!(
                        chain.iter().any(|n| n.name == *next),
                        "dangling transition out of {}",
                        state.name
                    );
                }
            }
        }
    }
}
