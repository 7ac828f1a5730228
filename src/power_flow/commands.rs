use serde::{Deserialize, Serialize};

/// Commands handed to collaborators at the end of every control cycle
///
/// Rebuilt from scratch each cycle; nothing carries over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlCommands {
    /// Battery power setpoint (positive = charge, negative = discharge)
    pub battery_setpoint_w: f64,
    pub pv_curtail: bool,
    pub pv_curtail_percent: f64,
    /// One flag per configured load, in configuration order
    pub load_shed: Vec<bool>,
    pub irrigation_enable: Vec<bool>,
    pub ev_charge_rate_w: Vec<f64>,
    pub grid_connect: bool,
    pub island: bool,
}

impl ControlCommands {
    /// Blank commands sized for the installation
    pub fn new(load_count: usize, zone_count: usize, charger_count: usize) -> Self {
        Self {
            battery_setpoint_w: 0.0,
            pv_curtail: false,
            pv_curtail_percent: 0.0,
            load_shed: vec![false; load_count],
            irrigation_enable: vec![false; zone_count],
            ev_charge_rate_w: vec![0.0; charger_count],
            grid_connect: false,
            island: false,
        }
    }

    /// All loads shed, irrigation and EV charging halted, disconnected from the grid
    pub fn safe_state(load_count: usize, zone_count: usize, charger_count: usize) -> Self {
        Self {
            load_shed: vec![true; load_count],
            island: true,
            ..Self::new(load_count, zone_count, charger_count)
        }
    }

    /// Safe state plus full PV curtailment
    pub fn emergency(load_count: usize, zone_count: usize, charger_count: usize) -> Self {
        let mut commands = Self::safe_state(load_count, zone_count, charger_count);
        commands.set_curtailment(100.0);
        commands
    }

    pub fn set_curtailment(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        self.pv_curtail = percent > 0.0;
        self.pv_curtail_percent = percent;
    }

    pub fn shed_count(&self) -> usize {
        self.load_shed.iter().filter(|shed| **shed).count()
    }
}
