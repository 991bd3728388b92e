//! Console command surface.

pub mod grammar;

pub use grammar::{parse, Command, ParseError, ScheduleSpec, TaskCommand};
