//! Boundary to the physical plant
//!
//! The controller core never talks to devices directly. Once per cycle it
//! pulls a `MeasurementSnapshot` and a `SubsystemReport` through
//! `Collaborators`, and pushes the resulting `ControlCommands` back.

use chrono::{DateTime, Utc};

use crate::power_flow::{ControlCommands, MeasurementSnapshot, SubsystemReport};

/// PV, battery, grid, load, irrigation and EV drivers as seen by the core
#[cfg_attr(test, mockall::automock)]
pub trait Collaborators {
    /// Fresh readings stamped with `now`
    fn read_measurements(&mut self, now: DateTime<Utc>) -> MeasurementSnapshot;

    /// Fault flags and scheduler requests from the PV, irrigation and EV subsystems
    fn subsystem_report(&mut self) -> SubsystemReport;

    fn apply_commands(&mut self, commands: &ControlCommands);
}
