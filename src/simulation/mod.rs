//! # Plant Simulation
//!
//! Stands in for real device drivers when the `sim` feature is enabled. The
//! binary drives the controller against `SimulatedPlant`; integration tests
//! use it to run whole days in a few milliseconds.

pub mod plant;

pub use plant::SimulatedPlant;
