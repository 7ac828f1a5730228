use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::error;
use validator::Validate;

use crate::power_flow::MeasurementSnapshot;

/// Safety event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// Battery temperature exceeded safe limits
    BatteryOverTemperature { temperature_c: f64, limit_c: f64 },
    /// Site consumption (loads, irrigation, EV) above the installation limit
    TotalPowerExceeded { power_w: f64, limit_w: f64 },
    LoadPowerExceeded { power_w: f64, limit_w: f64 },
    CriticalLoadPowerExceeded { power_w: f64, limit_w: f64 },
    /// Pack voltage outside the envelope the power electronics tolerate
    BatteryVoltageOutOfRange { voltage_v: f64, min_v: f64, max_v: f64 },
}

/// Hard limits; any violation sends the controller down the emergency path
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SafetyLimits {
    /// Maximum safe battery temperature (°C)
    pub max_battery_temp_c: f64,
    /// Maximum combined load, irrigation and EV power (W)
    #[validate(range(min = 0.0))]
    pub max_total_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_load_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_critical_load_power_w: f64,
    #[validate(range(min = 0.0))]
    pub min_battery_voltage_v: f64,
    #[validate(range(min = 0.0))]
    pub max_battery_voltage_v: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_battery_temp_c: 50.0,
            max_total_power_w: 20_000.0,
            max_load_power_w: 15_000.0,
            max_critical_load_power_w: 5_000.0,
            min_battery_voltage_v: 20.0,
            max_battery_voltage_v: 80.0,
        }
    }
}

/// Safety monitor for the battery and site power envelope
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    last_events: VecDeque<(DateTime<Utc>, SafetyEvent)>,
    max_event_history: usize,
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::with_limits(SafetyLimits::default())
    }
}

impl SafetyMonitor {
    pub fn with_limits(limits: SafetyLimits) -> Self {
        Self {
            limits,
            last_events: VecDeque::new(),
            max_event_history: 100,
        }
    }

    /// Check the snapshot against every hard limit
    ///
    /// Returns false on the first violation, after recording and logging it.
    pub fn within_limits(&mut self, snapshot: &MeasurementSnapshot, now: DateTime<Utc>) -> bool {
        match self.first_violation(snapshot) {
            None => true,
            Some(event) => {
                log_violation(&event);
                self.record_event(now, event);
                false
            }
        }
    }

    fn first_violation(&self, snapshot: &MeasurementSnapshot) -> Option<SafetyEvent> {
        let limits = &self.limits;

        if snapshot.battery_temperature_c > limits.max_battery_temp_c {
            return Some(SafetyEvent::BatteryOverTemperature {
                temperature_c: snapshot.battery_temperature_c,
                limit_c: limits.max_battery_temp_c,
            });
        }

        let total_power_w = snapshot.consumption_w();
        if total_power_w > limits.max_total_power_w {
            return Some(SafetyEvent::TotalPowerExceeded {
                power_w: total_power_w,
                limit_w: limits.max_total_power_w,
            });
        }

        if snapshot.load_power_w > limits.max_load_power_w {
            return Some(SafetyEvent::LoadPowerExceeded {
                power_w: snapshot.load_power_w,
                limit_w: limits.max_load_power_w,
            });
        }

        if snapshot.critical_load_power_w > limits.max_critical_load_power_w {
            return Some(SafetyEvent::CriticalLoadPowerExceeded {
                power_w: snapshot.critical_load_power_w,
                limit_w: limits.max_critical_load_power_w,
            });
        }

        let voltage_v = snapshot.battery_voltage_v;
        if voltage_v < limits.min_battery_voltage_v || voltage_v > limits.max_battery_voltage_v {
            return Some(SafetyEvent::BatteryVoltageOutOfRange {
                voltage_v,
                min_v: limits.min_battery_voltage_v,
                max_v: limits.max_battery_voltage_v,
            });
        }

        None
    }

    /// Record a safety event
    fn record_event(&mut self, timestamp: DateTime<Utc>, event: SafetyEvent) {
        self.last_events.push_back((timestamp, event));

        // Keep only the most recent events - O(1) with VecDeque
        if self.last_events.len() > self.max_event_history {
            self.last_events.pop_front();
        }
    }

    /// Get recent safety events
    pub fn get_recent_events(&self, count: usize) -> Vec<(DateTime<Utc>, SafetyEvent)> {
        let start = self.last_events.len().saturating_sub(count);
        self.last_events.iter().skip(start).cloned().collect()
    }

    pub fn clear_events(&mut self) {
        self.last_events.clear();
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }
}

fn log_violation(event: &SafetyEvent) {
    match event {
        SafetyEvent::BatteryOverTemperature { temperature_c, limit_c } => error!(
            temperature_c,
            limit_c,
            "SAFETY VIOLATION: battery over-temperature - initiating emergency shutdown"
        ),
        SafetyEvent::TotalPowerExceeded { power_w, limit_w } => error!(
            power_w,
            limit_w,
            "SAFETY VIOLATION: total site power exceeded"
        ),
        SafetyEvent::LoadPowerExceeded { power_w, limit_w } => error!(
            power_w,
            limit_w,
            "SAFETY VIOLATION: load power exceeded"
        ),
        SafetyEvent::CriticalLoadPowerExceeded { power_w, limit_w } => error!(
            power_w,
            limit_w,
            "SAFETY VIOLATION: critical load power exceeded"
        ),
        SafetyEvent::BatteryVoltageOutOfRange { voltage_v, min_v, max_v } => error!(
            voltage_v,
            min_v,
            max_v,
            "SAFETY VIOLATION: battery voltage out of range"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_safe_snapshot() -> MeasurementSnapshot {
        let mut s = MeasurementSnapshot::at_rest(Utc::now(), 52.0);
        s.load_power_w = 2_000.0;
        s.critical_load_power_w = 400.0;
        s
    }

    #[test]
    fn test_safe_snapshot() {
        let mut monitor = SafetyMonitor::default();
        assert!(monitor.within_limits(&make_safe_snapshot(), Utc::now()));
        assert!(monitor.get_recent_events(10).is_empty());
    }

    #[test]
    fn test_battery_over_temperature() {
        let mut monitor = SafetyMonitor::default();
        let mut s = make_safe_snapshot();
        s.battery_temperature_c = 65.0;
        assert!(!monitor.within_limits(&s, Utc::now()));
        assert!(matches!(
            monitor.get_recent_events(1)[0].1,
            SafetyEvent::BatteryOverTemperature { .. }
        ));
    }

    #[test]
    fn test_total_power_counts_irrigation_and_ev() {
        let mut monitor = SafetyMonitor::default();
        let mut s = make_safe_snapshot();
        s.load_power_w = 12_000.0;
        s.irrigation_power_w = 4_000.0;
        s.ev_charging_power_w = 7_000.0;
        assert!(!monitor.within_limits(&s, Utc::now()));
        assert!(matches!(
            monitor.get_recent_events(1)[0].1,
            SafetyEvent::TotalPowerExceeded { .. }
        ));
    }

    #[test]
    fn test_load_limits() {
        let mut monitor = SafetyMonitor::default();
        let mut s = make_safe_snapshot();
        s.load_power_w = 16_000.0;
        assert!(!monitor.within_limits(&s, Utc::now()));

        let mut s = make_safe_snapshot();
        s.critical_load_power_w = 6_000.0;
        assert!(!monitor.within_limits(&s, Utc::now()));
    }

    #[test]
    fn test_battery_voltage_envelope() {
        let mut monitor = SafetyMonitor::default();
        let mut s = make_safe_snapshot();
        s.battery_voltage_v = 15.0;
        assert!(!monitor.within_limits(&s, Utc::now()));
        s.battery_voltage_v = 85.0;
        assert!(!monitor.within_limits(&s, Utc::now()));
    }

    #[test]
    fn test_event_history() {
        let mut monitor = SafetyMonitor::default();
        for i in 0..5 {
            let mut s = make_safe_snapshot();
            s.battery_temperature_c = 65.0 + i as f64;
            monitor.within_limits(&s, Utc::now());
        }

        assert_eq!(monitor.last_events.len(), 5);
        assert_eq!(monitor.get_recent_events(3).len(), 3);

        monitor.clear_events();
        assert_eq!(monitor.last_events.len(), 0);
    }
}
