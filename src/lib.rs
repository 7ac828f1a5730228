pub mod battery;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod power_flow;
#[cfg(feature = "sim")]
pub mod simulation;
pub mod telemetry;
