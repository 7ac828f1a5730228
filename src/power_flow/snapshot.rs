use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Latest measurements for one control cycle
///
/// Sign conventions:
/// - battery current positive = charging
/// - grid power positive = import, negative = export
///
/// Collaborators fill in their slice; the core writes back `soc_percent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementSnapshot {
    pub battery_voltage_v: f64,
    pub battery_current_a: f64,
    pub battery_temperature_c: f64,
    /// SOC reported by the BMS, used only to seed the estimator
    pub bms_soc_percent: Option<f64>,

    pub pv_power_w: f64,

    pub load_power_w: f64,
    pub critical_load_power_w: f64,
    pub deferrable_load_power_w: f64,
    pub irrigation_power_w: f64,
    pub ev_charging_power_w: f64,

    pub grid_power_w: f64,
    pub grid_voltage_v: f64,
    pub grid_frequency_hz: f64,

    /// Smoothed SOC written by the estimator
    pub soc_percent: f64,

    /// Captured before collaborators are polled
    pub timestamp: DateTime<Utc>,
}

impl MeasurementSnapshot {
    /// An all-quiet snapshot: no generation, no load, battery at rest
    pub fn at_rest(timestamp: DateTime<Utc>, battery_voltage_v: f64) -> Self {
        Self {
            battery_voltage_v,
            battery_current_a: 0.0,
            battery_temperature_c: 25.0,
            bms_soc_percent: None,
            pv_power_w: 0.0,
            load_power_w: 0.0,
            critical_load_power_w: 0.0,
            deferrable_load_power_w: 0.0,
            irrigation_power_w: 0.0,
            ev_charging_power_w: 0.0,
            grid_power_w: 0.0,
            grid_voltage_v: 230.0,
            grid_frequency_hz: 50.0,
            soc_percent: 0.0,
            timestamp,
        }
    }

    /// Battery power at the terminals (positive = charging)
    pub fn battery_power_w(&self) -> f64 {
        self.battery_voltage_v * self.battery_current_a
    }

    pub fn generation_w(&self) -> f64 {
        self.pv_power_w.max(0.0)
    }

    /// Everything the site consumes: house loads, irrigation pumps and EV chargers
    pub fn consumption_w(&self) -> f64 {
        self.load_power_w.max(0.0) + self.irrigation_power_w.max(0.0) + self.ev_charging_power_w.max(0.0)
    }

    /// Generation minus consumption; positive means surplus
    pub fn net_balance_w(&self) -> f64 {
        self.generation_w() - self.consumption_w()
    }

    pub fn grid_import_w(&self) -> f64 {
        self.grid_power_w.max(0.0)
    }

    pub fn grid_export_w(&self) -> f64 {
        (-self.grid_power_w).max(0.0)
    }

    /// Verify power balance holds (sources = sinks) within `tolerance_w`
    ///
    /// Sources: PV, battery (if discharging), grid (if importing)
    /// Sinks: loads, battery (if charging), grid (if exporting)
    pub fn verify_power_balance(&self, tolerance_w: f64) -> bool {
        let battery_w = self.battery_power_w();
        let sources = self.generation_w() + self.grid_import_w() + (-battery_w).max(0.0);
        let sinks = self.consumption_w() + battery_w.max(0.0) + self.grid_export_w();
        (sources - sinks).abs() <= tolerance_w
    }
}

impl fmt::Display for MeasurementSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Snapshot {{ PV: {:.0}W, Loads: {:.0}W, Battery: {:.0}W @ {:.1}V, Grid: {:.0}W, SOC: {:.1}% }}",
            self.pv_power_w,
            self.consumption_w(),
            self.battery_power_w(),
            self.battery_voltage_v,
            self.grid_power_w,
            self.soc_percent,
        )
    }
}

/// Per-cycle report from the PV, irrigation and EV collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubsystemReport {
    pub pv_fault: bool,
    pub irrigation_fault: bool,
    pub ev_charger_fault: bool,
    /// Zones the irrigation scheduler wants running
    pub irrigation_requests: Vec<bool>,
    /// Charge rates the EV optimiser wants, one per charger (W)
    pub ev_rate_requests_w: Vec<f64>,
}
