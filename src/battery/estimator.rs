//! State-of-charge estimation
//!
//! Fuses a coulomb counter with an open-circuit-voltage lookup. The voltage
//! reading is only trusted near rest and in a comfortable temperature band;
//! under load the estimate follows the coulomb counter, and a large, trusted
//! divergence re-anchors the counter to the voltage curve.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::battery::chemistry;
use crate::domain::BatteryPack;
use crate::power_flow::MeasurementSnapshot;

const SECONDS_PER_HOUR: f64 = 3600.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Outside this band the voltage estimate is half as trustworthy
const COMFORT_LOW_C: f64 = 10.0;
const COMFORT_HIGH_C: f64 = 40.0;

impl BatteryPack {
    /// Update the SOC triple from one snapshot
    ///
    /// Sensor anomalies never surface as errors: a non-finite current counts as
    /// zero and an unusable voltage takes the voltage path out of the fusion.
    pub fn estimate_soc(&mut self, snapshot: &MeasurementSnapshot, now: DateTime<Utc>) {
        let current_a = if snapshot.battery_current_a.is_finite() {
            snapshot.battery_current_a
        } else {
            0.0
        };
        if snapshot.battery_temperature_c.is_finite() {
            self.temperature_c = snapshot.battery_temperature_c;
        }

        let voltage_usable = snapshot.battery_voltage_v.is_finite() && snapshot.battery_voltage_v > 0.0;
        let soc_voltage = if voltage_usable {
            let cell_v = snapshot.battery_voltage_v / self.series_cells as f64;
            chemistry::soc_from_cell_voltage(self.chemistry, cell_v)
        } else {
            self.soc.voltage
        };

        let total_ah = self.total_amp_hours();
        let first_pass = self.last_update.is_none();

        match self.last_update {
            None => {
                let seed = snapshot
                    .bms_soc_percent
                    .filter(|soc| soc.is_finite())
                    .map(|soc| soc.clamp(0.0, 100.0))
                    .unwrap_or(if voltage_usable { soc_voltage } else { self.soc.smoothed });
                self.charge_counter_ah = total_ah * seed / 100.0;
            }
            Some(last) => {
                let dt_s = ((now - last).num_milliseconds() as f64 / 1000.0).max(0.0);
                self.integrate_current(current_a, dt_s, total_ah);
            }
        }

        let mut soc_coulomb = if total_ah > 0.0 {
            (100.0 * self.charge_counter_ah / total_ah).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let w = if voltage_usable {
            self.voltage_weight(current_a)
        } else {
            0.0
        };
        let estimated = (1.0 - w) * soc_coulomb + w * soc_voltage;

        if w >= self.tuning.reanchor_min_weight
            && (soc_coulomb - soc_voltage).abs() > self.tuning.divergence_points
        {
            debug!(
                soc_coulomb,
                soc_voltage,
                voltage_weight = w,
                "coulomb counter re-anchored to voltage estimate"
            );
            self.charge_counter_ah = total_ah * soc_voltage / 100.0;
            soc_coulomb = soc_voltage;
        }

        let smoothed = if first_pass {
            estimated
        } else {
            self.smooth(estimated)
        };

        self.soc.coulomb = soc_coulomb;
        self.soc.voltage = soc_voltage;
        self.soc.estimated = estimated;
        self.soc.smoothed = smoothed.clamp(0.0, 100.0);
        self.capacity_remaining_wh = self.capacity_nominal_wh * self.soc.smoothed / 100.0;
        self.last_update = Some(now);
    }

    fn integrate_current(&mut self, current_a: f64, dt_s: f64, total_ah: f64) {
        let mut delta_ah = current_a * dt_s / SECONDS_PER_HOUR;
        if delta_ah > 0.0 {
            delta_ah *= self.tuning.coulomb_efficiency;
        }
        let self_discharge_ah = self.charge_counter_ah
            * (self.tuning.self_discharge_percent_per_day / 100.0)
            * (dt_s / SECONDS_PER_DAY);

        self.charge_counter_ah =
            (self.charge_counter_ah + delta_ah - self_discharge_ah).clamp(0.0, total_ah.max(0.0));
    }

    /// Trust placed in the voltage estimate for this pass, in [0, 1]
    pub fn voltage_weight(&self, current_a: f64) -> f64 {
        let mut w = self.tuning.voltage_weight;

        let rest_threshold_a = self.tuning.rest_current_fraction * self.max_charge_current_a();
        let magnitude = current_a.abs();
        if magnitude > rest_threshold_a {
            w *= (rest_threshold_a / magnitude).powi(2);
        }

        if self.temperature_c < COMFORT_LOW_C || self.temperature_c > COMFORT_HIGH_C {
            w *= 0.5;
        }

        if w.is_finite() {
            w.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn smooth(&self, estimated: f64) -> f64 {
        let previous = self.soc.smoothed;
        let swing = (estimated - previous).abs();

        let mut alpha = self.tuning.smoothing_factor;
        if swing > 1.0 {
            alpha = (alpha * 3.0).min(1.0);
        } else if swing < 0.1 {
            alpha *= 0.5;
        }
        let alpha = if alpha.is_finite() {
            alpha.clamp(0.0, 1.0)
        } else {
            0.0
        };

        previous + alpha * (estimated - previous)
    }
}
