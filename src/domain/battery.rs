use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::config::BatteryConfig;

/// Battery topology errors, raised while building a pack from configuration
#[derive(Debug, Error)]
pub enum BatteryError {
    #[error("battery pack has no enabled banks")]
    NoEnabledBanks,
    #[error("bank {bank_id}: {reason}")]
    InvalidBank { bank_id: String, reason: String },
    #[error("invalid pack topology: {0}")]
    InvalidTopology(String),
}

/// Battery chemistry type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatteryChemistry {
    /// Lithium iron phosphate
    Lfp,
    /// Nickel manganese cobalt
    Nmc,
    /// Flooded / AGM lead acid
    LeadAcid,
}

/// Charging stage, only meaningful while the pack is charging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChargeStage {
    Bulk,
    Absorption,
    Float,
    Equalize,
}

/// Battery operational state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatteryState {
    Idle,
    Charging(ChargeStage),
    Discharging,
    Fault,
    Maintenance,
}

impl BatteryState {
    pub fn charge_stage(&self) -> Option<ChargeStage> {
        match self {
            BatteryState::Charging(stage) => Some(*stage),
            _ => None,
        }
    }

    pub fn is_charging(&self) -> bool {
        matches!(self, BatteryState::Charging(_))
    }

    /// Fault and Maintenance block both charging and discharging
    pub fn is_locked_out(&self) -> bool {
        matches!(self, BatteryState::Fault | BatteryState::Maintenance)
    }
}

impl std::fmt::Display for BatteryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatteryState::Idle => write!(f, "idle"),
            BatteryState::Charging(stage) => write!(f, "charging/{}", stage),
            BatteryState::Discharging => write!(f, "discharging"),
            BatteryState::Fault => write!(f, "fault"),
            BatteryState::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Individual battery protection fault
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryFault {
    Overvoltage,
    Undervoltage,
    Overcurrent,
    Overtemperature,
}

impl BatteryFault {
    pub fn bit(self) -> u8 {
        match self {
            BatteryFault::Overvoltage => 1 << 0,
            BatteryFault::Undervoltage => 1 << 1,
            BatteryFault::Overcurrent => 1 << 2,
            BatteryFault::Overtemperature => 1 << 3,
        }
    }
}

/// Bitset of active battery faults
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaultSet(u8);

impl FaultSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, fault: BatteryFault) {
        self.0 |= fault.bit();
    }

    pub fn remove(&mut self, fault: BatteryFault) {
        self.0 &= !fault.bit();
    }

    pub fn contains(&self, fault: BatteryFault) -> bool {
        self.0 & fault.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = BatteryFault> + '_ {
        use strum::IntoEnumIterator;
        BatteryFault::iter().filter(move |f| self.contains(*f))
    }
}

/// One physical battery bank; banks in a pack are wired in parallel
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatteryBank {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(min = 1.0))]
    pub nominal_voltage_v: f64,
    #[validate(range(min = 1))]
    pub series_cells: u32,
    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0))]
    pub max_charge_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_power_w: f64,
    #[serde(default)]
    pub cycle_count: u32,
    #[serde(default = "default_health")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub health_percent: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_health() -> f64 {
    100.0
}

fn default_enabled() -> bool {
    true
}

/// State-of-charge estimates, all in percent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SocTriple {
    /// Coulomb counting estimate
    pub coulomb: f64,
    /// Open-circuit-voltage estimate
    pub voltage: f64,
    /// Fused estimate before smoothing
    pub estimated: f64,
    /// Filtered value used for control decisions
    pub smoothed: f64,
}

impl SocTriple {
    pub fn uniform(soc_percent: f64) -> Self {
        Self {
            coulomb: soc_percent,
            voltage: soc_percent,
            estimated: soc_percent,
            smoothed: soc_percent,
        }
    }
}

/// Battery tuning parameters
///
/// SOC values are percent, powers are watts, durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryTuning {
    /// Weight given to the voltage estimate at rest in a comfortable temperature band
    pub voltage_weight: f64,
    /// Base exponential smoothing factor
    pub smoothing_factor: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc: f64,
    /// Below this SOC the pack is considered critically low (emergency charging)
    #[validate(range(min = 0.0, max = 100.0))]
    pub critical_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub bulk_limit_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub absorption_limit_soc: f64,
    /// Float reverts to bulk this many points below the bulk limit
    pub float_fallback_points: f64,
    #[validate(range(min = 0.5, max = 1.0))]
    pub coulomb_efficiency: f64,
    #[validate(range(min = 0.0, max = 10.0))]
    pub self_discharge_percent_per_day: f64,
    /// Fraction of the charge-current limit above which the pack is not at rest
    pub rest_current_fraction: f64,
    /// Minimum voltage weight for the coulomb counter to be re-anchored
    pub reanchor_min_weight: f64,
    pub divergence_points: f64,
    #[validate(range(min = 0.0))]
    pub min_charge_surplus_w: f64,
    #[validate(range(min = 0.0))]
    pub emergency_charge_surplus_w: f64,
    #[validate(range(min = 0.0))]
    pub emergency_charge_w: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub emergency_charge_fraction: f64,
    #[validate(range(min = 1.0))]
    pub absorption_duration_s: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub absorption_floor: f64,
    #[validate(range(min = 1.0))]
    pub equalize_duration_s: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub float_power_fraction: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub equalize_power_fraction: f64,
    #[validate(range(min = 0.0))]
    pub min_discharge_load_w: f64,
    /// Discharge into local load while grid-connected once SOC is high enough
    pub peak_shaving_enabled: bool,
    #[validate(range(min = 0.0, max = 100.0))]
    pub peak_shave_soc: f64,
    /// SOC band above `min_soc` over which discharge power tapers to zero
    #[validate(range(min = 0.1))]
    pub discharge_headroom_band: f64,
    #[validate(range(min = 0.0))]
    pub min_time_to_floor_min: f64,
    pub max_clear_attempts: u32,
    #[validate(range(min = 0.0))]
    pub clear_attempt_reset_s: f64,
    #[validate(range(min = 1.0))]
    pub overcurrent_trip_factor: f64,
    #[validate(range(min = 0.1))]
    pub overcurrent_recovery_factor: f64,
    pub cooling_on_c: f64,
    pub cooling_off_c: f64,
    pub heating_on_c: f64,
    pub heating_off_c: f64,
}

impl Default for BatteryTuning {
    fn default() -> Self {
        Self {
            voltage_weight: 0.3,
            smoothing_factor: 0.1,
            min_soc: 20.0,
            max_soc: 95.0,
            critical_soc: 20.0,
            bulk_limit_soc: 85.0,
            absorption_limit_soc: 95.0,
            float_fallback_points: 5.0,
            coulomb_efficiency: 0.98,
            self_discharge_percent_per_day: 0.1,
            rest_current_fraction: 0.05,
            reanchor_min_weight: 0.25,
            divergence_points: 18.0,
            min_charge_surplus_w: 100.0,
            emergency_charge_surplus_w: 1.0,
            emergency_charge_w: 100.0,
            emergency_charge_fraction: 0.1,
            absorption_duration_s: 7200.0,
            absorption_floor: 0.1,
            equalize_duration_s: 3600.0,
            float_power_fraction: 0.05,
            equalize_power_fraction: 0.1,
            min_discharge_load_w: 50.0,
            peak_shaving_enabled: true,
            peak_shave_soc: 70.0,
            discharge_headroom_band: 10.0,
            min_time_to_floor_min: 30.0,
            max_clear_attempts: 3,
            clear_attempt_reset_s: 3600.0,
            overcurrent_trip_factor: 1.2,
            overcurrent_recovery_factor: 1.0,
            cooling_on_c: 35.0,
            cooling_off_c: 30.0,
            heating_on_c: 5.0,
            heating_off_c: 10.0,
        }
    }
}

/// The battery pack and everything the estimator and state machine own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryPack {
    pub chemistry: BatteryChemistry,
    pub banks: Vec<BatteryBank>,
    pub nominal_voltage_v: f64,
    pub series_cells: u32,
    pub capacity_nominal_wh: f64,
    pub capacity_remaining_wh: f64,
    pub health_percent: f64,

    /// Coulomb counter, Ah stored
    pub charge_counter_ah: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub soc: SocTriple,
    pub temperature_c: f64,

    pub faults: FaultSet,
    pub fault_since: Option<DateTime<Utc>>,
    pub fault_reason: Option<String>,
    pub clear_attempts: u32,
    pub last_fault_cleared: Option<DateTime<Utc>>,

    pub state: BatteryState,
    pub previous_state: BatteryState,
    pub absorption_started: Option<DateTime<Utc>>,
    pub equalize_started: Option<DateTime<Utc>>,
    pub equalize_requested: bool,

    pub cooling_active: bool,
    pub heating_active: bool,

    pub tuning: BatteryTuning,
}

impl BatteryPack {
    /// Build a pack from validated configuration
    pub fn from_config(cfg: &BatteryConfig) -> Result<Self, BatteryError> {
        if cfg.series_cells == 0 {
            return Err(BatteryError::InvalidTopology(
                "series cell count must be positive".to_string(),
            ));
        }
        if cfg.nominal_voltage_v <= 0.0 {
            return Err(BatteryError::InvalidTopology(
                "nominal pack voltage must be positive".to_string(),
            ));
        }
        for bank in &cfg.banks {
            if bank.capacity_wh <= 0.0 {
                return Err(BatteryError::InvalidBank {
                    bank_id: bank.id.clone(),
                    reason: "capacity must be positive".to_string(),
                });
            }
        }

        let enabled: Vec<&BatteryBank> = cfg.banks.iter().filter(|b| b.enabled).collect();
        if enabled.is_empty() {
            return Err(BatteryError::NoEnabledBanks);
        }

        let capacity_nominal_wh: f64 = enabled.iter().map(|b| b.capacity_wh).sum();
        let health_percent =
            enabled.iter().map(|b| b.health_percent).sum::<f64>() / enabled.len() as f64;
        let initial_soc = cfg.initial_soc_percent.clamp(0.0, 100.0);

        let mut pack = Self {
            chemistry: cfg.chemistry,
            banks: cfg.banks.clone(),
            nominal_voltage_v: cfg.nominal_voltage_v,
            series_cells: cfg.series_cells,
            capacity_nominal_wh,
            capacity_remaining_wh: 0.0,
            health_percent,
            charge_counter_ah: 0.0,
            last_update: None,
            soc: SocTriple::uniform(initial_soc),
            temperature_c: 25.0,
            faults: FaultSet::empty(),
            fault_since: None,
            fault_reason: None,
            clear_attempts: 0,
            last_fault_cleared: None,
            state: BatteryState::Idle,
            previous_state: BatteryState::Idle,
            absorption_started: None,
            equalize_started: None,
            equalize_requested: false,
            cooling_active: false,
            heating_active: false,
            tuning: cfg.tuning.clone(),
        };
        pack.charge_counter_ah = pack.total_amp_hours() * initial_soc / 100.0;
        pack.capacity_remaining_wh = pack.capacity_nominal_wh * initial_soc / 100.0;
        Ok(pack)
    }

    pub fn enabled_banks(&self) -> impl Iterator<Item = &BatteryBank> {
        self.banks.iter().filter(|b| b.enabled)
    }

    /// Total charge the coulomb counter can hold
    pub fn total_amp_hours(&self) -> f64 {
        self.capacity_nominal_wh / self.nominal_voltage_v
    }

    pub fn rated_charge_power_w(&self) -> f64 {
        self.enabled_banks().map(|b| b.max_charge_power_w).sum()
    }

    pub fn rated_discharge_power_w(&self) -> f64 {
        self.enabled_banks().map(|b| b.max_discharge_power_w).sum()
    }

    pub fn max_charge_current_a(&self) -> f64 {
        self.rated_charge_power_w() / self.nominal_voltage_v
    }

    pub fn max_discharge_current_a(&self) -> f64 {
        self.rated_discharge_power_w() / self.nominal_voltage_v
    }

    /// Smoothed SOC used by every control decision
    pub fn soc_percent(&self) -> f64 {
        self.soc.smoothed
    }

    pub fn is_critically_low(&self) -> bool {
        self.soc.smoothed < self.tuning.critical_soc
    }

    /// Move to a new state, remembering where we came from
    pub(crate) fn transition(&mut self, next: BatteryState) {
        if self.state != next {
            self.previous_state = self.state;
            self.state = next;
        }
    }
}
