use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError};

use crate::controller::load_shedding::SheddingConfig;
use crate::controller::safety::SafetyLimits;
use crate::domain::{BatteryBank, BatteryChemistry, BatteryTuning, LoadDefinition};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const ENV_PREFIX: &str = "HEC__";

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_soc_thresholds"))]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub controller: ControllerSettings,
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub loads: Vec<LoadDefinition>,
    #[serde(default)]
    #[validate(nested)]
    pub shedding: SheddingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub safety: SafetyLimits,
    #[serde(default)]
    #[validate(nested)]
    pub grid: GridConfig,
    #[serde(default)]
    #[validate(nested)]
    pub arbitration: ArbitrationConfig,
    #[serde(default)]
    #[validate(nested)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerSettings {
    /// Minimum time between control cycles
    #[validate(range(min = 0.01))]
    pub interval_s: f64,
    /// Log a status summary every N completed cycles
    #[validate(range(min = 1))]
    pub status_log_every: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            interval_s: 1.0,
            status_log_every: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatteryConfig {
    pub chemistry: BatteryChemistry,
    #[validate(range(min = 1.0))]
    pub nominal_voltage_v: f64,
    #[validate(range(min = 1))]
    pub series_cells: u32,
    #[serde(default = "default_initial_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc_percent: f64,
    #[validate(length(min = 1), nested)]
    pub banks: Vec<BatteryBank>,
    #[serde(default)]
    #[validate(nested)]
    pub tuning: BatteryTuning,
}

fn default_initial_soc() -> f64 {
    50.0
}

/// Grid acceptance window with import and export allowances
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GridConfig {
    #[validate(range(min = 0.0))]
    pub min_voltage_v: f64,
    #[validate(range(min = 0.0))]
    pub max_voltage_v: f64,
    #[validate(range(min = 0.0))]
    pub min_frequency_hz: f64,
    #[validate(range(min = 0.0))]
    pub max_frequency_hz: f64,
    pub nominal_frequency_hz: f64,
    /// Frequency deviation that raises the grid-unstable warning
    #[validate(range(min = 0.0))]
    pub unstable_deviation_hz: f64,
    /// Power the site may draw from the grid when shedding is evaluated
    #[validate(range(min = 0.0))]
    pub import_limit_w: f64,
    /// Whether surplus may be fed into the grid at all
    pub export_allowed: bool,
    /// Most power the site may feed into the grid; `None` means no limit
    #[validate(range(min = 0.0))]
    pub export_limit_w: Option<f64>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            min_voltage_v: 200.0,
            max_voltage_v: 260.0,
            min_frequency_hz: 49.5,
            max_frequency_hz: 50.5,
            nominal_frequency_hz: 50.0,
            unstable_deviation_hz: 0.2,
            import_limit_w: 10_000.0,
            export_allowed: true,
            export_limit_w: None,
        }
    }
}

impl GridConfig {
    pub fn accepts(&self, voltage_v: f64, frequency_hz: f64) -> bool {
        voltage_v > self.min_voltage_v
            && voltage_v < self.max_voltage_v
            && frequency_hz > self.min_frequency_hz
            && frequency_hz < self.max_frequency_hz
    }

    /// Surplus the grid will take while connected (W)
    pub fn export_cap_w(&self) -> f64 {
        if self.export_allowed {
            self.export_limit_w.unwrap_or(f64::INFINITY)
        } else {
            0.0
        }
    }
}

/// Power-balance policy knobs
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// SOC above which surplus PV is curtailed
    #[validate(range(min = 0.0, max = 100.0))]
    pub curtail_start_soc: f64,
    #[validate(range(min = 0.0))]
    pub curtail_percent_per_soc_point: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_curtail_percent: f64,
    /// Surplus left after charging that triggers curtailment
    #[validate(range(min = 0.0))]
    pub curtail_surplus_threshold_w: f64,
    /// Points above the critical SOC needed to leave Critical mode
    #[validate(range(min = 0.0, max = 50.0))]
    pub critical_recovery_points: f64,
    pub irrigation_zones: usize,
    pub ev_chargers: usize,
    #[validate(range(min = 0.0))]
    pub ev_max_rate_w: f64,
    pub battery_high_temp_warning_c: f64,
    #[validate(range(min = 0.0))]
    pub high_load_warning_w: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            curtail_start_soc: 90.0,
            curtail_percent_per_soc_point: 5.0,
            max_soc_curtail_percent: 50.0,
            curtail_surplus_threshold_w: 100.0,
            critical_recovery_points: 5.0,
            irrigation_zones: 0,
            ev_chargers: 0,
            ev_max_rate_w: 7_400.0,
            battery_high_temp_warning_c: 45.0,
            high_load_warning_w: 10_000.0,
        }
    }
}

/// Parameters for the simulated plant driven by the binary
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimulationConfig {
    #[validate(range(min = 0.0))]
    pub pv_peak_w: f64,
    #[validate(range(min = 0.0))]
    pub base_load_w: f64,
    /// Relative measurement noise, 0.02 = ±2 %
    #[validate(range(min = 0.0, max = 0.5))]
    pub noise_fraction: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    pub grid_available: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            pv_peak_w: 6_000.0,
            base_load_w: 1_200.0,
            noise_fraction: 0.02,
            seed: None,
            grid_available: true,
        }
    }
}

fn validate_soc_thresholds(cfg: &Config) -> Result<(), ValidationError> {
    let t = &cfg.battery.tuning;
    if t.min_soc >= t.max_soc {
        return Err(ValidationError::new("min_soc_above_max_soc"));
    }
    if t.bulk_limit_soc > t.absorption_limit_soc {
        return Err(ValidationError::new("bulk_limit_above_absorption_limit"));
    }
    if t.absorption_limit_soc > t.max_soc {
        return Err(ValidationError::new("absorption_limit_above_max_soc"));
    }
    if t.overcurrent_recovery_factor > t.overcurrent_trip_factor {
        return Err(ValidationError::new("overcurrent_recovery_above_trip"));
    }
    if cfg.grid.min_voltage_v >= cfg.grid.max_voltage_v
        || cfg.grid.min_frequency_hz >= cfg.grid.max_frequency_hz
    {
        return Err(ValidationError::new("empty_grid_window"));
    }
    Ok(())
}

impl Config {
    /// Load `config/default.toml` overlaid with `HEC__*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let cfg: Config = figment
            .extract()
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }

    /// Parse an inline TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg: Config = Figment::from(Toml::string(toml))
            .extract()
            .context("parsing inline configuration")?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use figment::Jail;

    pub(crate) const MINIMAL: &str = r#"
        [battery]
        chemistry = "lfp"
        nominal_voltage_v = 51.2
        series_cells = 16

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
        id = "pool_pump"
        rated_power_w = 800.0
        priority = "non_essential"
    "#;

    #[test]
    fn test_load_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("hec.toml", MINIMAL)?;
            let cfg = Config::load_from("hec.toml").map_err(|e| e.to_string())?;
            assert_eq!(cfg.controller.interval_s, 1.0);
            assert_eq!(cfg.battery.chemistry, BatteryChemistry::Lfp);
            assert_eq!(cfg.battery.initial_soc_percent, 50.0);
            assert_eq!(cfg.battery.tuning.max_soc, 95.0);
            assert_eq!(cfg.loads.len(), 2);
            assert!(!cfg.loads[0].sheddable);
            assert!(cfg.loads[1].sheddable);
            assert!(cfg.loads[1].is_on());
            assert_eq!(cfg.shedding.shed_available_ceiling_w, None);
            assert_eq!(cfg.safety.max_battery_temp_c, 50.0);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("hec.toml", MINIMAL)?;
            jail.set_env("HEC__CONTROLLER__INTERVAL_S", "2.5");
            jail.set_env("HEC__BATTERY__TUNING__PEAK_SHAVE_SOC", "80");
            let cfg = Config::load_from("hec.toml").map_err(|e| e.to_string())?;
            assert_eq!(cfg.controller.interval_s, 2.5);
            assert_eq!(cfg.battery.tuning.peak_shave_soc, 80.0);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_inverted_soc_window() {
        Jail::expect_with(|jail| {
            jail.create_file("hec.toml", MINIMAL)?;
            jail.set_env("HEC__BATTERY__TUNING__MIN_SOC", "96");
            assert!(Config::load_from("hec.toml").is_err());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_absorption_limit_above_max_soc() {
        Jail::expect_with(|jail| {
            jail.create_file("hec.toml", MINIMAL)?;
            jail.set_env("HEC__BATTERY__TUNING__MAX_SOC", "90");
            assert!(Config::load_from("hec.toml").is_err());
            jail.set_env("HEC__BATTERY__TUNING__ABSORPTION_LIMIT_SOC", "90");
            assert!(Config::load_from("hec.toml").is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_empty_bank_list() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "hec.toml",
                r#"
                [battery]
                chemistry = "nmc"
                nominal_voltage_v = 48.0
                series_cells = 13
                banks = []
                "#,
            )?;
            assert!(Config::load_from("hec.toml").is_err());
            Ok(())
        });
    }

    #[test]
    fn test_inline_toml() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.battery.banks.len(), 1);
        assert_eq!(cfg.arbitration.ev_chargers, 0);
        assert!(Config::from_toml_str("[battery]").is_err());
    }

    #[test]
    fn test_grid_window() {
        let grid = GridConfig::default();
        assert!(grid.accepts(230.0, 50.0));
        assert!(!grid.accepts(0.0, 50.0));
        assert!(!grid.accepts(230.0, 51.0));
    }

    #[test]
    fn test_export_cap() {
        let mut grid = GridConfig::default();
        assert_eq!(grid.export_cap_w(), f64::INFINITY);
        grid.export_limit_w = Some(3_000.0);
        assert_eq!(grid.export_cap_w(), 3_000.0);
        grid.export_allowed = false;
        assert_eq!(grid.export_cap_w(), 0.0);
    }

    #[test]
    fn test_export_limit_from_env() {
        Jail::expect_with(|jail| {
            jail.create_file("hec.toml", MINIMAL)?;
            jail.set_env("HEC__GRID__EXPORT_LIMIT_W", "2500");
            let cfg = Config::load_from("hec.toml").map_err(|e| e.to_string())?;
            assert_eq!(cfg.grid.export_limit_w, Some(2500.0));
            assert!(cfg.grid.export_allowed);
            Ok(())
        });
    }
}
