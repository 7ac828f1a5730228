#![allow(dead_code)]

use chrono::{DateTime, Utc};
use hybrid_energy_controller::battery::cell_voltage_from_soc;
use hybrid_energy_controller::config::Config;
use hybrid_energy_controller::domain::BatteryChemistry;
use hybrid_energy_controller::hardware::Collaborators;
use hybrid_energy_controller::power_flow::{ControlCommands, MeasurementSnapshot, SubsystemReport};

pub const SITE: &str = r#"
    [battery]
    chemistry = "lfp"
    nominal_voltage_v = 51.2
    series_cells = 16
    initial_soc_percent = 60.0

    [[battery.banks]]
    id = "bank-1"
    nominal_voltage_v = 51.2
    series_cells = 16
    capacity_wh = 10000.0
    max_charge_power_w = 5000.0
    max_discharge_power_w = 5000.0

    [[loads]]
    id = "fridge"
    rated_power_w = 150.0
    priority = "critical"
    sheddable = false

    [[loads]]
    id = "lighting"
    rated_power_w = 300.0
    priority = "high"

    [[loads]]
    id = "pool_pump"
    rated_power_w = 800.0
    priority = "non_essential"

    [arbitration]
    irrigation_zones = 1
    ev_chargers = 1

    [simulation]
    seed = 7
    base_load_w = 300.0
"#;

pub fn site_config() -> Config {
    Config::from_toml_str(SITE).expect("site config")
}

/// Scripted plant: returns whatever snapshot the test put in, records commands
pub struct ScriptedPlant {
    pub snapshot: MeasurementSnapshot,
    pub report: SubsystemReport,
    pub applied: Vec<ControlCommands>,
}

impl ScriptedPlant {
    pub fn at_soc(soc_percent: f64) -> Self {
        let voltage = cell_voltage_from_soc(BatteryChemistry::Lfp, soc_percent) * 16.0;
        let mut snapshot = MeasurementSnapshot::at_rest(Utc::now(), voltage);
        snapshot.bms_soc_percent = Some(soc_percent);
        Self {
            snapshot,
            report: SubsystemReport::default(),
            applied: Vec::new(),
        }
    }

    pub fn islanded(mut self) -> Self {
        self.snapshot.grid_voltage_v = 0.0;
        self.snapshot.grid_frequency_hz = 0.0;
        self
    }
}

impl Collaborators for ScriptedPlant {
    fn read_measurements(&mut self, now: DateTime<Utc>) -> MeasurementSnapshot {
        MeasurementSnapshot {
            timestamp: now,
            ..self.snapshot.clone()
        }
    }

    fn subsystem_report(&mut self) -> SubsystemReport {
        self.report.clone()
    }

    fn apply_commands(&mut self, commands: &ControlCommands) {
        self.applied.push(commands.clone());
    }
}
