//! Battery algorithms operating on `domain::BatteryPack`
//!
//! - `estimator`: coulomb/voltage SOC fusion
//! - `state_machine`: charge stages and discharge decisions
//! - `protection`: latched faults and thermal management
//! - `chemistry`: OCV curves, protection thresholds and derating per chemistry

pub mod chemistry;
pub mod estimator;
pub mod protection;
pub mod state_machine;

pub use chemistry::{
    cell_voltage_from_soc, ocv_table, profile, soc_from_cell_voltage, ChemistryProfile, DerateCurve,
};
pub use protection::{FaultCheck, HysteresisBand};
