use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::power_flow::MeasurementSnapshot;

const WS_PER_KWH: f64 = 3_600_000.0;

/// Cumulative energy totals and event counters since start-up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatistics {
    pub pv_energy_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub battery_charge_kwh: f64,
    pub battery_discharge_kwh: f64,
    pub load_energy_kwh: f64,
    pub irrigation_energy_kwh: f64,
    pub ev_energy_kwh: f64,
    pub grid_outages: u64,
    pub island_events: u64,
    pub load_shed_events: u64,
    pub cycles: u64,
    pub started_at: DateTime<Utc>,
}

impl SystemStatistics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            pv_energy_kwh: 0.0,
            grid_import_kwh: 0.0,
            grid_export_kwh: 0.0,
            battery_charge_kwh: 0.0,
            battery_discharge_kwh: 0.0,
            load_energy_kwh: 0.0,
            irrigation_energy_kwh: 0.0,
            ev_energy_kwh: 0.0,
            grid_outages: 0,
            island_events: 0,
            load_shed_events: 0,
            cycles: 0,
            started_at: now,
        }
    }

    /// Integrate one snapshot over the actual elapsed interval
    pub fn accumulate(&mut self, snapshot: &MeasurementSnapshot, dt_s: f64) {
        let dt_s = dt_s.max(0.0);
        let kwh = |w: f64| w.max(0.0) * dt_s / WS_PER_KWH;

        self.pv_energy_kwh += kwh(snapshot.pv_power_w);
        self.grid_import_kwh += kwh(snapshot.grid_import_w());
        self.grid_export_kwh += kwh(snapshot.grid_export_w());

        let battery_w = snapshot.battery_power_w();
        if battery_w.is_finite() {
            self.battery_charge_kwh += kwh(battery_w);
            self.battery_discharge_kwh += kwh(-battery_w);
        }

        self.load_energy_kwh += kwh(snapshot.load_power_w);
        self.irrigation_energy_kwh += kwh(snapshot.irrigation_power_w);
        self.ev_energy_kwh += kwh(snapshot.ev_charging_power_w);
    }

    /// Fraction of consumed energy that did not come from the grid
    pub fn self_sufficiency(&self) -> Option<f64> {
        let consumed = self.load_energy_kwh + self.irrigation_energy_kwh + self.ev_energy_kwh;
        if consumed <= 0.0 {
            return None;
        }
        Some((1.0 - self.grid_import_kwh / consumed).clamp(0.0, 1.0))
    }
}
