#![no_std]

// Shared logic for the autonomous water-sampler controller.
//
// This crate stays portable across MCU firmware and host tooling by avoiding
// the Rust standard library. All timing, scheduling, valve accounting, and
// procedure sequencing lives here; hardware, persistence, and the clock are
// traits implemented by the embedding target (see `hardware`).

pub mod actions;
pub mod config;
pub mod controller;
pub mod hardware;
pub mod procedure;
pub mod repl;
pub mod status;
pub mod tasks;
pub mod telemetry;
pub mod time;
pub mod valves;

/// Maximum number of physical sampling ports the controller supports.
pub const MAX_VALVES: usize = 24;

/// Maximum number of durable tasks held in memory at once.
pub const MAX_TASKS: usize = 10;
