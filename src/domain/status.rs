use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System operating mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemMode {
    /// Grid-connected normal operation
    Normal,
    /// Off-grid operation
    Island,
    /// Islanded with a critically low battery; critical loads only
    Critical,
    Maintenance,
    Emergency,
}

/// Battery state-of-charge band
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SocCategory {
    /// Below 20%
    Critical,
    /// 20-40%
    Low,
    /// 40-70%
    Medium,
    /// 70-90%
    High,
    /// 90% and above
    Full,
}

impl SocCategory {
    pub fn from_soc(soc_percent: f64) -> Self {
        if soc_percent < 20.0 {
            SocCategory::Critical
        } else if soc_percent < 40.0 {
            SocCategory::Low
        } else if soc_percent < 70.0 {
            SocCategory::Medium
        } else if soc_percent < 90.0 {
            SocCategory::High
        } else {
            SocCategory::Full
        }
    }
}

/// Alarm codes; each maps to one bit of `SystemStatus::alarms`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Alarm {
    GridFailure,
    BatteryOverTemp,
    BatteryLowSoc,
    PvDisconnect,
    Overload,
    BatteryFault,
    IrrigationFault,
    EvChargerFault,
    SafetyShutdown,
    MaintenanceRequired,
}

impl Alarm {
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Warning codes; each maps to one bit of `SystemStatus::warnings`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Warning {
    BatteryHighTemp,
    BatteryLowSoc,
    GridUnstable,
    HighLoad,
}

impl Warning {
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Externally visible system status, mutated only by the control cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    pub mode: SystemMode,
    pub grid_available: bool,
    pub soc_category: SocCategory,
    pub alarms: u32,
    pub warnings: u32,
    pub last_mode_change: DateTime<Utc>,
    pub uptime_s: f64,
}

impl SystemStatus {
    pub fn new(now: DateTime<Utc>, soc_percent: f64) -> Self {
        Self {
            mode: SystemMode::Normal,
            grid_available: true,
            soc_category: SocCategory::from_soc(soc_percent),
            alarms: 0,
            warnings: 0,
            last_mode_change: now,
            uptime_s: 0.0,
        }
    }

    pub fn has_alarm(&self, alarm: Alarm) -> bool {
        self.alarms & alarm.bit() != 0
    }

    pub fn has_warning(&self, warning: Warning) -> bool {
        self.warnings & warning.bit() != 0
    }

    /// Change mode, stamping the transition time; returns whether it changed
    pub(crate) fn set_mode(&mut self, mode: SystemMode, now: DateTime<Utc>) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        self.last_mode_change = now;
        true
    }
}
