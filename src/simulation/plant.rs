//! # Simulated Plant
//!
//! A single-node model of the site: a sine-shaped PV day, the configured
//! loads, an ideal battery integrating its setpoint, and a grid that absorbs
//! whatever is left over while it is available.

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use std::f64::consts::PI;

use crate::battery::cell_voltage_from_soc;
use crate::config::Config;
use crate::domain::{BatteryChemistry, LoadDefinition, LoadPriority};
use crate::hardware::Collaborators;
use crate::power_flow::{ControlCommands, MeasurementSnapshot, SubsystemReport};

/// Pump draw of one irrigation zone (W)
const IRRIGATION_ZONE_W: f64 = 750.0;
/// Pack internal resistance seen at the terminals (Ω)
const INTERNAL_RESISTANCE_OHM: f64 = 0.01;
const AMBIENT_C: f64 = 25.0;
/// Temperature rise per kW of battery throughput at steady state
const HEATING_C_PER_KW: f64 = 3.0;
const THERMAL_TIME_CONSTANT_S: f64 = 600.0;
/// Longest step the model integrates in one go
const MAX_STEP_S: f64 = 3_600.0;

pub struct SimulatedPlant {
    chemistry: BatteryChemistry,
    series_cells: u32,
    capacity_wh: f64,
    max_charge_w: f64,
    max_discharge_w: f64,
    soc_percent: f64,
    temperature_c: f64,
    battery_power_w: f64,

    pv_peak_w: f64,
    base_load_w: f64,
    noise_fraction: f64,
    loads: Vec<LoadDefinition>,
    irrigation_zones: usize,
    ev_chargers: usize,
    ev_max_rate_w: f64,

    grid_available: bool,
    nominal_frequency_hz: f64,
    commands: ControlCommands,
    last_read: Option<DateTime<Utc>>,
    rng: rand::rngs::StdRng,
}

impl SimulatedPlant {
    pub fn new(config: &Config) -> Self {
        use rand::SeedableRng;

        let rng = match config.simulation.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };

        let enabled = config.battery.banks.iter().filter(|b| b.enabled);
        let (capacity_wh, max_charge_w, max_discharge_w) =
            enabled.fold((0.0, 0.0, 0.0), |(c, ch, dis), b| {
                (c + b.capacity_wh, ch + b.max_charge_power_w, dis + b.max_discharge_power_w)
            });
        let arbitration = &config.arbitration;

        Self {
            chemistry: config.battery.chemistry,
            series_cells: config.battery.series_cells,
            capacity_wh,
            max_charge_w,
            max_discharge_w,
            soc_percent: config.battery.initial_soc_percent.clamp(0.0, 100.0),
            temperature_c: AMBIENT_C,
            battery_power_w: 0.0,
            pv_peak_w: config.simulation.pv_peak_w,
            base_load_w: config.simulation.base_load_w,
            noise_fraction: config.simulation.noise_fraction,
            loads: config.loads.clone(),
            irrigation_zones: arbitration.irrigation_zones,
            ev_chargers: arbitration.ev_chargers,
            ev_max_rate_w: arbitration.ev_max_rate_w,
            grid_available: config.simulation.grid_available,
            nominal_frequency_hz: config.grid.nominal_frequency_hz,
            commands: ControlCommands::new(
                config.loads.len(),
                arbitration.irrigation_zones,
                arbitration.ev_chargers,
            ),
            last_read: None,
            rng,
        }
    }

    pub fn set_grid_available(&mut self, available: bool) {
        self.grid_available = available;
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_percent
    }

    pub fn last_commands(&self) -> &ControlCommands {
        &self.commands
    }

    fn noise(&mut self) -> f64 {
        1.0 + self.rng.gen_range(-1.0..=1.0) * self.noise_fraction
    }

    /// Clear-sky output for the hour of day, before curtailment
    fn pv_available_w(&self, now: DateTime<Utc>) -> f64 {
        let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
        if !(6.0..18.0).contains(&hour) {
            return 0.0;
        }
        self.pv_peak_w * (PI * (hour - 6.0) / 12.0).sin()
    }

    /// Advance the battery by `dt_s` at the last commanded setpoint
    fn step_battery(&mut self, dt_s: f64) {
        let mut power_w = self
            .commands
            .battery_setpoint_w
            .clamp(-self.max_discharge_w, self.max_charge_w);
        if (power_w > 0.0 && self.soc_percent >= 100.0) || (power_w < 0.0 && self.soc_percent <= 0.0) {
            power_w = 0.0;
        }
        self.battery_power_w = power_w;

        if self.capacity_wh > 0.0 {
            self.soc_percent += power_w * dt_s / 3_600.0 / self.capacity_wh * 100.0;
            self.soc_percent = self.soc_percent.clamp(0.0, 100.0);
        }

        let target_c = AMBIENT_C + power_w.abs() / 1_000.0 * HEATING_C_PER_KW;
        let blend = (dt_s / THERMAL_TIME_CONSTANT_S).min(1.0);
        self.temperature_c += (target_c - self.temperature_c) * blend;
    }
}

impl Collaborators for SimulatedPlant {
    fn read_measurements(&mut self, now: DateTime<Utc>) -> MeasurementSnapshot {
        let dt_s = self
            .last_read
            .map(|last| ((now - last).num_milliseconds() as f64 / 1_000.0).clamp(0.0, MAX_STEP_S))
            .unwrap_or(0.0);
        self.last_read = Some(now);
        self.step_battery(dt_s);

        let ocv_v = cell_voltage_from_soc(self.chemistry, self.soc_percent) * self.series_cells as f64;
        let current_a = if ocv_v > 0.0 { self.battery_power_w / ocv_v } else { 0.0 };
        let battery_voltage_v = ocv_v + current_a * INTERNAL_RESISTANCE_OHM;

        let curtail = 1.0 - self.commands.pv_curtail_percent / 100.0;
        let pv_power_w = (self.pv_available_w(now) * curtail * self.noise()).max(0.0);

        let mut critical_w = 0.0;
        let mut deferrable_w = 0.0;
        let mut managed_w = 0.0;
        for (i, load) in self.loads.iter().enumerate() {
            if self.commands.load_shed.get(i).copied().unwrap_or(false) {
                continue;
            }
            managed_w += load.rated_power_w;
            if load.priority == LoadPriority::Critical {
                critical_w += load.rated_power_w;
            }
            if load.deferrable {
                deferrable_w += load.rated_power_w;
            }
        }
        let load_power_w = (self.base_load_w + managed_w) * self.noise();

        let irrigation_power_w =
            self.commands.irrigation_enable.iter().filter(|on| **on).count() as f64 * IRRIGATION_ZONE_W;
        let ev_charging_power_w: f64 = self.commands.ev_charge_rate_w.iter().map(|r| r.max(0.0)).sum();

        let mut snapshot = MeasurementSnapshot::at_rest(now, battery_voltage_v);
        snapshot.battery_current_a = current_a;
        snapshot.battery_temperature_c = self.temperature_c;
        snapshot.bms_soc_percent = Some(self.soc_percent);
        snapshot.pv_power_w = pv_power_w;
        snapshot.load_power_w = load_power_w;
        snapshot.critical_load_power_w = critical_w;
        snapshot.deferrable_load_power_w = deferrable_w;
        snapshot.irrigation_power_w = irrigation_power_w;
        snapshot.ev_charging_power_w = ev_charging_power_w;

        if self.grid_available {
            snapshot.grid_power_w = snapshot.consumption_w() + snapshot.battery_power_w() - pv_power_w;
            snapshot.grid_voltage_v = 230.0 * self.noise();
            snapshot.grid_frequency_hz = self.nominal_frequency_hz + self.rng.gen_range(-0.05..=0.05);
        } else {
            snapshot.grid_power_w = 0.0;
            snapshot.grid_voltage_v = 0.0;
            snapshot.grid_frequency_hz = 0.0;
        }
        snapshot
    }

    fn subsystem_report(&mut self) -> SubsystemReport {
        let hour = self.last_read.map(|t| t.hour()).unwrap_or(0);
        let watering = (5..7).contains(&hour);
        let overnight = hour >= 18 || hour < 6;

        SubsystemReport {
            irrigation_requests: vec![watering; self.irrigation_zones],
            ev_rate_requests_w: vec![if overnight { self.ev_max_rate_w } else { 0.0 }; self.ev_chargers],
            ..Default::default()
        }
    }

    fn apply_commands(&mut self, commands: &ControlCommands) {
        self.commands = commands.clone();
    }
}
