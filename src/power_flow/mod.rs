//! Measurement and command records exchanged with collaborators
//!
//! Everything the core reads arrives in a `MeasurementSnapshot` and a
//! `SubsystemReport`; everything it decides leaves as `ControlCommands`.

pub mod commands;
pub mod snapshot;

pub use commands::ControlCommands;
pub use snapshot::{MeasurementSnapshot, SubsystemReport};
