//! The control cycle
//!
//! `EnergyController` owns every piece of mutable state: the battery pack,
//! the load table, alarm latches, statistics and the last issued commands.
//! Each cycle it reads the plant through `Collaborators`, decides, and hands
//! a fresh `ControlCommands` back.

pub mod alarms;
pub mod load_shedding;
pub mod safety;
pub mod statistics;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::config::{ArbitrationConfig, Config, ControllerSettings, GridConfig};
use crate::domain::{
    Alarm, BatteryError, BatteryFault, BatteryPack, BatteryState, SocCategory, SystemMode,
    SystemStatus, Warning,
};
use crate::hardware::Collaborators;
use crate::power_flow::{ControlCommands, MeasurementSnapshot, SubsystemReport};
use crate::battery::FaultCheck;

pub use alarms::{AlarmLatch, WarningLatch};
pub use load_shedding::{LoadDemand, LoadManager, SheddingConfig};
pub use safety::{SafetyEvent, SafetyLimits, SafetyMonitor};
pub use statistics::SystemStatistics;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),
    #[error(transparent)]
    Battery(#[from] BatteryError),
}

/// What one call to `run_cycle` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The interval had not elapsed; nothing changed
    Skipped,
    Completed(SystemMode),
    /// A hard safety limit was violated and emergency commands went out
    Emergency,
}

pub struct EnergyController<C: Collaborators> {
    settings: ControllerSettings,
    grid: GridConfig,
    arbitration: ArbitrationConfig,
    collaborators: C,

    battery: BatteryPack,
    loads: LoadManager,
    safety: SafetyMonitor,
    alarms: AlarmLatch,
    warnings: WarningLatch,
    status: SystemStatus,
    statistics: SystemStatistics,
    commands: ControlCommands,
    snapshot: Option<MeasurementSnapshot>,

    maintenance_requested: bool,
    started_at: DateTime<Utc>,
    last_cycle: Option<DateTime<Utc>>,
}

impl<C: Collaborators> EnergyController<C> {
    pub fn new(config: Config, collaborators: C, now: DateTime<Utc>) -> Result<Self, ControllerError> {
        config.validate()?;

        let battery = BatteryPack::from_config(&config.battery)?;
        let critical_soc = battery.tuning.critical_soc;
        let commands = ControlCommands::new(
            config.loads.len(),
            config.arbitration.irrigation_zones,
            config.arbitration.ev_chargers,
        );

        info!(
            chemistry = %battery.chemistry,
            capacity_wh = battery.capacity_nominal_wh,
            loads = config.loads.len(),
            irrigation_zones = config.arbitration.irrigation_zones,
            ev_chargers = config.arbitration.ev_chargers,
            "energy controller initialised"
        );

        Ok(Self {
            settings: config.controller,
            grid: config.grid,
            arbitration: config.arbitration,
            collaborators,
            status: SystemStatus::new(now, battery.soc_percent()),
            loads: LoadManager::new(config.loads, config.shedding, critical_soc),
            safety: SafetyMonitor::with_limits(config.safety),
            battery,
            alarms: AlarmLatch::default(),
            warnings: WarningLatch::default(),
            statistics: SystemStatistics::new(now),
            commands,
            snapshot: None,
            maintenance_requested: false,
            started_at: now,
            last_cycle: None,
        })
    }

    /// Drive cycles on a fixed interval until `shutdown` resolves, then apply the safe state
    ///
    /// Each cycle is stamped with its tick's scheduled instant rather than the
    /// wake-up time, so scheduler jitter never makes a tick look early.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let start = tokio::time::Instant::now();
        let start_utc = Utc::now();
        // Whole milliseconds, rounded up, so consecutive stamps always pass the gate
        let period = Duration::from_millis((self.settings.interval_s * 1000.0).ceil() as u64);
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                scheduled = interval.tick() => {
                    let offset = chrono::Duration::from_std(scheduled.saturating_duration_since(start))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    self.run_cycle(start_utc + offset);
                }
            }
        }
        self.shutdown();
    }

    /// One pass of the control loop
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let dt_s = match self.last_cycle {
            Some(last) => {
                let elapsed = elapsed_s(last, now);
                if elapsed < self.settings.interval_s {
                    return CycleOutcome::Skipped;
                }
                elapsed
            }
            None => 0.0,
        };
        self.last_cycle = Some(now);
        self.statistics.cycles += 1;
        self.status.uptime_s = elapsed_s(self.started_at, now);

        let mut snapshot = self.collaborators.read_measurements(now);
        let report = self.collaborators.subsystem_report();

        self.battery.estimate_soc(&snapshot, now);
        let fault_check = self.battery.check_limits(&snapshot, now);
        self.battery.manage_thermal();
        snapshot.soc_percent = self.battery.soc_percent();
        debug!(%snapshot, battery_state = %self.battery.state, "cycle");

        if !self.safety.within_limits(&snapshot, now) {
            self.enter_emergency(now);
            self.finish_cycle(snapshot, dt_s);
            return CycleOutcome::Emergency;
        }
        self.alarms.update(Alarm::SafetyShutdown, false, "", now);

        self.update_alarms(&snapshot, &report, now);
        let mode = self.determine_mode(&snapshot, fault_check, now);
        self.update_warnings(&snapshot, now);

        self.commands = self.arbitrate(&snapshot, &report, now);
        self.finish_cycle(snapshot, dt_s);
        CycleOutcome::Completed(mode)
    }

    /// Push the safe state: everything shed, battery idle, islanded
    pub fn shutdown(&mut self) {
        self.commands = ControlCommands::safe_state(
            self.loads.loads().len(),
            self.arbitration.irrigation_zones,
            self.arbitration.ev_chargers,
        );
        self.collaborators.apply_commands(&self.commands);
        info!(
            cycles = self.statistics.cycles,
            pv_energy_kwh = self.statistics.pv_energy_kwh,
            grid_import_kwh = self.statistics.grid_import_kwh,
            "energy controller shut down"
        );
    }

    /// Operator-requested maintenance; the battery stays idle until released
    pub fn enter_maintenance(&mut self, now: DateTime<Utc>) {
        self.maintenance_requested = true;
        if self.status.set_mode(SystemMode::Maintenance, now) {
            info!("maintenance mode entered by operator");
        }
    }

    /// Leave maintenance, resetting a battery parked by recurring faults
    pub fn exit_maintenance(&mut self, now: DateTime<Utc>) {
        self.maintenance_requested = false;
        self.battery.acknowledge_maintenance(now);
        info!("maintenance released by operator");
    }

    /// Queue an equalization charge; lead-acid packs at the absorption limit only
    pub fn request_equalize(&mut self) -> bool {
        self.battery.request_equalize()
    }

    pub fn status(&self) -> &SystemStatus {
        &self.status
    }

    pub fn commands(&self) -> &ControlCommands {
        &self.commands
    }

    pub fn statistics(&self) -> &SystemStatistics {
        &self.statistics
    }

    pub fn battery(&self) -> &BatteryPack {
        &self.battery
    }

    pub fn loads(&self) -> &LoadManager {
        &self.loads
    }

    pub fn alarms(&self) -> &AlarmLatch {
        &self.alarms
    }

    pub fn warnings(&self) -> &WarningLatch {
        &self.warnings
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    /// Snapshot of the last completed or emergency cycle
    pub fn last_snapshot(&self) -> Option<&MeasurementSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn collaborators(&self) -> &C {
        &self.collaborators
    }

    pub fn collaborators_mut(&mut self) -> &mut C {
        &mut self.collaborators
    }

    fn enter_emergency(&mut self, now: DateTime<Utc>) {
        self.alarms
            .update(Alarm::SafetyShutdown, true, "hard safety limit violated", now);
        if self.status.set_mode(SystemMode::Emergency, now) {
            error!(soc_percent = self.battery.soc_percent(), "emergency shutdown");
        }
        self.battery.halt();
        self.commands = ControlCommands::emergency(
            self.loads.loads().len(),
            self.arbitration.irrigation_zones,
            self.arbitration.ev_chargers,
        );
    }

    fn finish_cycle(&mut self, snapshot: MeasurementSnapshot, dt_s: f64) {
        self.status.alarms = self.alarms.mask();
        self.status.warnings = self.warnings.mask();
        self.status.soc_category = SocCategory::from_soc(self.battery.soc_percent());

        self.statistics.accumulate(&snapshot, dt_s);
        self.statistics.load_shed_events = self.loads.shed_event_count();

        self.collaborators.apply_commands(&self.commands);

        if self.statistics.cycles % self.settings.status_log_every == 0 {
            info!(
                mode = %self.status.mode,
                soc_percent = self.battery.soc_percent(),
                battery_state = %self.battery.state,
                pv_w = snapshot.pv_power_w,
                consumption_w = snapshot.consumption_w(),
                grid_w = snapshot.grid_power_w,
                setpoint_w = self.commands.battery_setpoint_w,
                shed_loads = self.commands.shed_count(),
                alarms = self.status.alarms,
                "status"
            );
        }
        self.snapshot = Some(snapshot);
    }

    fn update_alarms(&mut self, snapshot: &MeasurementSnapshot, report: &SubsystemReport, now: DateTime<Utc>) {
        let battery = &self.battery;
        let supply_w = snapshot.generation_w()
            + battery.max_discharge_power_w()
            + if self.status.grid_available { self.grid.import_limit_w } else { 0.0 };

        let conditions = [
            (Alarm::PvDisconnect, report.pv_fault, "PV inverter reports a fault"),
            (Alarm::IrrigationFault, report.irrigation_fault, "irrigation controller reports a fault"),
            (Alarm::EvChargerFault, report.ev_charger_fault, "EV charger reports a fault"),
            (
                Alarm::BatteryOverTemp,
                battery.faults.contains(BatteryFault::Overtemperature),
                "battery over temperature",
            ),
            (
                Alarm::BatteryFault,
                !battery.faults.is_empty(),
                battery.fault_reason.as_deref().unwrap_or("battery fault latched"),
            ),
            (
                Alarm::MaintenanceRequired,
                battery.state == BatteryState::Maintenance,
                "battery faults keep recurring",
            ),
            (
                Alarm::Overload,
                snapshot.consumption_w() > supply_w,
                "consumption exceeds available supply",
            ),
        ];
        for (alarm, active, description) in conditions {
            self.alarms.update(alarm, active, description, now);
        }
    }

    fn determine_mode(
        &mut self,
        snapshot: &MeasurementSnapshot,
        fault_check: FaultCheck,
        now: DateTime<Utc>,
    ) -> SystemMode {
        let grid_ok = self.grid.accepts(snapshot.grid_voltage_v, snapshot.grid_frequency_hz);
        if self.status.grid_available && !grid_ok {
            self.statistics.grid_outages += 1;
            warn!(
                voltage_v = snapshot.grid_voltage_v,
                frequency_hz = snapshot.grid_frequency_hz,
                "grid lost"
            );
        } else if !self.status.grid_available && grid_ok {
            info!("grid restored");
        }
        self.status.grid_available = grid_ok;
        self.alarms.update(
            Alarm::GridFailure,
            !grid_ok,
            "grid voltage or frequency outside window",
            now,
        );

        let soc = self.battery.soc_percent();
        let critical_soc = self.battery.tuning.critical_soc;
        let current = self.status.mode;
        let next = if fault_check == FaultCheck::Persistent || self.maintenance_requested {
            SystemMode::Maintenance
        } else if grid_ok {
            SystemMode::Normal
        } else if soc < critical_soc
            || (current == SystemMode::Critical
                && soc < critical_soc + self.arbitration.critical_recovery_points)
        {
            SystemMode::Critical
        } else {
            SystemMode::Island
        };

        self.alarms.update(
            Alarm::BatteryLowSoc,
            next == SystemMode::Critical,
            "islanded with critically low battery",
            now,
        );

        let off_grid = |m: SystemMode| matches!(m, SystemMode::Island | SystemMode::Critical);
        if self.status.set_mode(next, now) {
            info!(from = %current, to = %next, soc_percent = soc, "mode change");
            if off_grid(next) && !off_grid(current) {
                self.statistics.island_events += 1;
            }
        }
        next
    }

    fn update_warnings(&mut self, snapshot: &MeasurementSnapshot, now: DateTime<Utc>) {
        let frequency_deviation = (snapshot.grid_frequency_hz - self.grid.nominal_frequency_hz).abs();
        let conditions = [
            (
                Warning::BatteryHighTemp,
                self.battery.temperature_c > self.arbitration.battery_high_temp_warning_c,
                "battery temperature high",
            ),
            (
                Warning::BatteryLowSoc,
                self.battery.soc_percent() < 40.0,
                "battery state of charge low",
            ),
            (
                Warning::GridUnstable,
                self.status.grid_available && frequency_deviation > self.grid.unstable_deviation_hz,
                "grid frequency drifting",
            ),
            (
                Warning::HighLoad,
                snapshot.consumption_w() > self.arbitration.high_load_warning_w,
                "site consumption high",
            ),
        ];
        for (warning, active, description) in conditions {
            self.warnings.update(warning, active, description, now);
        }
    }

    /// Balance generation against consumption and build this cycle's commands
    fn arbitrate(
        &mut self,
        snapshot: &MeasurementSnapshot,
        report: &SubsystemReport,
        now: DateTime<Utc>,
    ) -> ControlCommands {
        let mode = self.status.mode;
        let grid = self.status.grid_available;
        let generation_w = snapshot.generation_w();
        let consumption_w = snapshot.consumption_w();
        let balance_w = generation_w - consumption_w;
        let mut commands = ControlCommands::new(
            self.loads.loads().len(),
            self.arbitration.irrigation_zones,
            self.arbitration.ev_chargers,
        );

        let mut charge_w = 0.0;
        let mut discharge_w = 0.0;
        if mode != SystemMode::Maintenance {
            if balance_w > 0.0 {
                charge_w = self.battery.manage_charging(generation_w, consumption_w, now);
            } else {
                discharge_w = self.battery.manage_discharging(-balance_w, grid);
                if discharge_w <= 0.0 && self.battery.state.is_charging() {
                    self.battery.manage_charging(generation_w, consumption_w, now);
                }
            }
        }
        commands.battery_setpoint_w = charge_w - discharge_w;

        let islanded = !grid || matches!(mode, SystemMode::Island | SystemMode::Critical);
        if balance_w > 0.0 {
            commands.set_curtailment(self.curtailment_percent(balance_w - charge_w, generation_w, islanded));
        }

        let available_w = generation_w + discharge_w + if grid { self.grid.import_limit_w } else { 0.0 };
        if self
            .loads
            .manage_shedding(available_w, consumption_w, self.battery.soc_percent(), grid, now)
        {
            debug!(shed = self.loads.shed_flags().iter().filter(|s| **s).count(), "load table changed");
        }
        commands.load_shed = self.loads.shed_flags();

        if mode != SystemMode::Critical {
            for (enable, requested) in commands.irrigation_enable.iter_mut().zip(&report.irrigation_requests) {
                *enable = *requested;
            }
            let max_rate_w = self.arbitration.ev_max_rate_w;
            for (rate, requested) in commands.ev_charge_rate_w.iter_mut().zip(&report.ev_rate_requests_w) {
                *rate = if requested.is_finite() {
                    requested.clamp(0.0, max_rate_w)
                } else {
                    0.0
                };
            }
        }

        commands.grid_connect = grid && matches!(mode, SystemMode::Normal | SystemMode::Maintenance);
        commands.island = islanded;
        commands
    }

    fn curtailment_percent(&self, remaining_w: f64, generation_w: f64, islanded: bool) -> f64 {
        let cfg = &self.arbitration;
        let mut percent = 0.0;

        if remaining_w > cfg.curtail_surplus_threshold_w {
            let soc = self.battery.soc_percent();
            if soc > cfg.curtail_start_soc {
                percent = ((soc - cfg.curtail_start_soc) * cfg.curtail_percent_per_soc_point)
                    .min(cfg.max_soc_curtail_percent);
            }
            if islanded && generation_w > 0.0 {
                percent = percent.max(remaining_w / generation_w * 100.0);
            }
        }

        // Surplus the grid will not take has to stay on the roof
        let export_cap_w = self.grid.export_cap_w();
        if !islanded && generation_w > 0.0 && remaining_w > export_cap_w {
            percent = percent.max((remaining_w - export_cap_w) / generation_w * 100.0);
        }
        percent
    }
}

fn elapsed_s(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::cell_voltage_from_soc;
    use crate::config::tests::MINIMAL;
    use crate::domain::BatteryChemistry;
    use crate::hardware::MockCollaborators;
    use chrono::Duration as ChronoDuration;

    fn config() -> Config {
        let mut cfg = Config::from_toml_str(MINIMAL).unwrap();
        cfg.arbitration.irrigation_zones = 1;
        cfg.arbitration.ev_chargers = 1;
        cfg
    }

    fn snapshot_at_soc(now: DateTime<Utc>, soc: f64) -> MeasurementSnapshot {
        let voltage = cell_voltage_from_soc(BatteryChemistry::Lfp, soc) * 16.0;
        let mut s = MeasurementSnapshot::at_rest(now, voltage);
        s.bms_soc_percent = Some(soc);
        s.load_power_w = 950.0;
        s.critical_load_power_w = 150.0;
        s
    }

    fn mock_with(snapshot: MeasurementSnapshot, report: SubsystemReport) -> MockCollaborators {
        let mut mock = MockCollaborators::new();
        mock.expect_read_measurements()
            .returning(move |now| MeasurementSnapshot { timestamp: now, ..snapshot.clone() });
        mock.expect_subsystem_report().returning(move || report.clone());
        mock.expect_apply_commands().return_const(());
        mock
    }

    #[test]
    fn test_cycle_gated_by_interval() {
        let t0 = Utc::now();
        let mut mock = MockCollaborators::new();
        let s = snapshot_at_soc(t0, 60.0);
        mock.expect_read_measurements().times(1).returning(move |_| s.clone());
        mock.expect_subsystem_report().times(1).returning(SubsystemReport::default);
        mock.expect_apply_commands().times(1).return_const(());

        let mut controller = EnergyController::new(config(), mock, t0).unwrap();
        assert_eq!(controller.run_cycle(t0), CycleOutcome::Completed(SystemMode::Normal));
        let commands = controller.commands().clone();
        assert_eq!(
            controller.run_cycle(t0 + ChronoDuration::milliseconds(500)),
            CycleOutcome::Skipped
        );
        assert_eq!(controller.commands(), &commands);
        assert_eq!(controller.statistics().cycles, 1);
    }

    #[test]
    fn test_call_just_before_interval_is_skipped() {
        let t0 = Utc::now();
        let mut mock = MockCollaborators::new();
        let s = snapshot_at_soc(t0, 60.0);
        mock.expect_read_measurements().times(2).returning(move |_| s.clone());
        mock.expect_subsystem_report().times(2).returning(SubsystemReport::default);
        mock.expect_apply_commands().times(2).return_const(());

        let mut controller = EnergyController::new(config(), mock, t0).unwrap();
        controller.run_cycle(t0);
        let battery = serde_json::to_string(controller.battery()).unwrap();

        for early_ms in [985, 999] {
            let at = t0 + ChronoDuration::milliseconds(early_ms);
            assert_eq!(controller.run_cycle(at), CycleOutcome::Skipped);
        }
        assert_eq!(serde_json::to_string(controller.battery()).unwrap(), battery);
        assert_eq!(controller.statistics().cycles, 1);

        let on_time = t0 + ChronoDuration::milliseconds(1000);
        assert_eq!(controller.run_cycle(on_time), CycleOutcome::Completed(SystemMode::Normal));
        assert_eq!(controller.statistics().cycles, 2);
    }

    #[test]
    fn test_over_temperature_takes_emergency_path() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 60.0);
        s.battery_temperature_c = 65.0;
        let mut mock = MockCollaborators::new();
        mock.expect_read_measurements().returning(move |_| s.clone());
        mock.expect_subsystem_report().returning(SubsystemReport::default);
        mock.expect_apply_commands()
            .withf(|c| c.pv_curtail_percent == 100.0 && c.island && !c.grid_connect)
            .times(1)
            .return_const(());

        let mut controller = EnergyController::new(config(), mock, t0).unwrap();
        assert_eq!(controller.run_cycle(t0), CycleOutcome::Emergency);
        assert_eq!(controller.status().mode, SystemMode::Emergency);
        assert!(controller.status().has_alarm(Alarm::SafetyShutdown));
        assert_eq!(controller.commands().load_shed, vec![true, true]);
        assert_eq!(controller.commands().battery_setpoint_w, 0.0);
        // load states are left alone
        assert!(controller.loads().loads().iter().all(|l| l.is_on()));
    }

    #[test]
    fn test_emergency_idles_charging_battery() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);
        let mut cfg = config();
        cfg.battery.initial_soc_percent = 90.0;
        let mut s = snapshot_at_soc(t0, 90.0);
        s.pv_power_w = 6_000.0;
        let mut overloaded = s.clone();
        overloaded.critical_load_power_w = 6_000.0;

        let mut mock = MockCollaborators::new();
        mock.expect_read_measurements()
            .returning(move |now| if now < t1 { s.clone() } else { overloaded.clone() });
        mock.expect_subsystem_report().returning(SubsystemReport::default);
        mock.expect_apply_commands().return_const(());
        let mut controller = EnergyController::new(cfg, mock, t0).unwrap();

        controller.run_cycle(t0);
        assert_eq!(
            controller.battery().state,
            BatteryState::Charging(crate::domain::ChargeStage::Absorption)
        );
        assert!(controller.battery().absorption_started.is_some());

        assert_eq!(controller.run_cycle(t1), CycleOutcome::Emergency);
        assert_eq!(controller.commands().battery_setpoint_w, 0.0);
        assert_eq!(controller.battery().state, BatteryState::Idle);
        assert!(controller.battery().absorption_started.is_none());
    }

    #[test]
    fn test_grid_loss_islands() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 60.0);
        s.grid_voltage_v = 0.0;
        s.grid_frequency_hz = 0.0;
        let mut controller = EnergyController::new(config(), mock_with(s, SubsystemReport::default()), t0).unwrap();

        assert_eq!(controller.run_cycle(t0), CycleOutcome::Completed(SystemMode::Island));
        assert!(controller.status().has_alarm(Alarm::GridFailure));
        assert!(!controller.status().grid_available);
        assert_eq!(controller.statistics().grid_outages, 1);
        assert_eq!(controller.statistics().island_events, 1);
        let c = controller.commands();
        assert!(c.island);
        assert!(!c.grid_connect);
        // islanded with no PV: the battery covers the load
        assert!(c.battery_setpoint_w < 0.0);
    }

    #[test]
    fn test_critical_mode_blocks_irrigation_and_ev() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 10.0);
        s.grid_voltage_v = 0.0;
        let report = SubsystemReport {
            irrigation_requests: vec![true],
            ev_rate_requests_w: vec![7_000.0],
            ..Default::default()
        };
        let mut controller = EnergyController::new(config(), mock_with(s, report), t0).unwrap();

        assert_eq!(controller.run_cycle(t0), CycleOutcome::Completed(SystemMode::Critical));
        assert!(controller.status().has_alarm(Alarm::BatteryLowSoc));
        let c = controller.commands();
        assert_eq!(c.irrigation_enable, vec![false]);
        assert_eq!(c.ev_charge_rate_w, vec![0.0]);
        // every sheddable load goes when islanded below the critical SOC
        assert_eq!(c.load_shed, vec![false, true]);
    }

    #[test]
    fn test_requests_pass_through_when_grid_connected() {
        let t0 = Utc::now();
        let s = snapshot_at_soc(t0, 60.0);
        let report = SubsystemReport {
            irrigation_requests: vec![true],
            ev_rate_requests_w: vec![20_000.0],
            ..Default::default()
        };
        let mut controller = EnergyController::new(config(), mock_with(s, report), t0).unwrap();

        controller.run_cycle(t0);
        let c = controller.commands();
        assert!(c.grid_connect);
        assert!(!c.island);
        assert_eq!(c.irrigation_enable, vec![true]);
        assert_eq!(c.ev_charge_rate_w, vec![7_400.0]);
    }

    #[test]
    fn test_surplus_charges_battery() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 50.0);
        s.pv_power_w = 3_000.0;
        let mut controller =
            EnergyController::new(config(), mock_with(s, SubsystemReport::default()), t0).unwrap();

        controller.run_cycle(t0);
        let c = controller.commands();
        assert!(c.battery_setpoint_w > 0.0);
        assert!(c.battery_setpoint_w <= 3_000.0 - 950.0 + 1e-9);
        assert!(controller.battery().state.is_charging());
    }

    #[test]
    fn test_surplus_above_export_limit_is_curtailed() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 60.0);
        s.pv_power_w = 10_000.0;

        // 10 kW PV - 950 W load - 5 kW charge leaves 4050 W to export
        let mut cfg = config();
        cfg.grid.export_limit_w = Some(1_000.0);
        let mut controller =
            EnergyController::new(cfg.clone(), mock_with(s.clone(), SubsystemReport::default()), t0).unwrap();
        controller.run_cycle(t0);
        let c = controller.commands();
        assert!((c.battery_setpoint_w - 5_000.0).abs() < 1e-6);
        assert!(c.pv_curtail);
        assert!((c.pv_curtail_percent - 30.5).abs() < 1e-6);

        cfg.grid.export_allowed = false;
        let mut controller =
            EnergyController::new(cfg, mock_with(s.clone(), SubsystemReport::default()), t0).unwrap();
        controller.run_cycle(t0);
        assert!((controller.commands().pv_curtail_percent - 40.5).abs() < 1e-6);

        let mut controller = EnergyController::new(config(), mock_with(s, SubsystemReport::default()), t0).unwrap();
        controller.run_cycle(t0);
        assert!(!controller.commands().pv_curtail);
    }

    #[test]
    fn test_operator_maintenance_idles_battery() {
        let t0 = Utc::now();
        let mut s = snapshot_at_soc(t0, 50.0);
        s.pv_power_w = 3_000.0;
        let mut controller =
            EnergyController::new(config(), mock_with(s, SubsystemReport::default()), t0).unwrap();

        controller.enter_maintenance(t0);
        assert_eq!(controller.run_cycle(t0), CycleOutcome::Completed(SystemMode::Maintenance));
        assert_eq!(controller.commands().battery_setpoint_w, 0.0);

        controller.exit_maintenance(t0);
        let t1 = t0 + ChronoDuration::seconds(1);
        assert_eq!(controller.run_cycle(t1), CycleOutcome::Completed(SystemMode::Normal));
    }

    #[test]
    fn test_shutdown_applies_safe_state() {
        let t0 = Utc::now();
        let mut mock = MockCollaborators::new();
        mock.expect_apply_commands()
            .withf(|c| c.island && c.load_shed.iter().all(|s| *s) && c.pv_curtail_percent == 0.0)
            .times(1)
            .return_const(());

        let mut controller = EnergyController::new(config(), mock, t0).unwrap();
        controller.shutdown();
    }
}
