//! Battery protection: latched faults with hysteresis, thermal management
//!
//! Every protection limit has a trip threshold and a separate, less strict
//! recovery threshold. A fault bit sets on a single sample past the trip
//! threshold and only clears once a sample reaches the recovery threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::battery::chemistry;
use crate::domain::{BatteryFault, BatteryPack, BatteryState};
use crate::power_flow::MeasurementSnapshot;

/// Trip/recovery threshold pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisBand {
    pub trip: f64,
    pub recover: f64,
    /// True when the fault is on the high side (overvoltage, overtemperature)
    pub rising: bool,
}

impl HysteresisBand {
    pub const fn rising(trip: f64, recover: f64) -> Self {
        Self {
            trip,
            recover,
            rising: true,
        }
    }

    pub const fn falling(trip: f64, recover: f64) -> Self {
        Self {
            trip,
            recover,
            rising: false,
        }
    }

    /// Next latch state given the current one and a new sample
    ///
    /// Non-finite samples leave the latch untouched.
    pub fn evaluate(&self, active: bool, value: f64) -> bool {
        if !value.is_finite() {
            return active;
        }
        let (tripped, recovered) = if self.rising {
            (value > self.trip, value <= self.recover)
        } else {
            (value < self.trip, value >= self.recover)
        };
        if tripped {
            true
        } else if active && recovered {
            false
        } else {
            active
        }
    }
}

/// Outcome of one protection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCheck {
    /// No fault bits set
    Healthy,
    /// At least one new fault bit set this pass; the pack is in Fault
    Tripped,
    /// Fault bits still latched from an earlier pass
    Active,
    /// Every fault bit cleared this pass; the pack resumed its previous state
    Cleared,
    /// Faults keep coming back; the pack is parked in Maintenance
    Persistent,
}

impl BatteryPack {
    /// Evaluate every protection band against the snapshot
    pub fn check_limits(&mut self, snapshot: &MeasurementSnapshot, now: DateTime<Utc>) -> FaultCheck {
        self.decay_clear_attempts(now);

        let profile = chemistry::profile(self.chemistry);
        let cell_voltage_v = snapshot.battery_voltage_v / self.series_cells as f64;
        let current_a = if snapshot.battery_current_a.is_finite() {
            snapshot.battery_current_a
        } else {
            0.0
        };
        let current_limit_a = if current_a >= 0.0 {
            self.max_charge_current_a()
        } else {
            self.max_discharge_current_a()
        };
        let overcurrent = HysteresisBand::rising(
            current_limit_a * self.tuning.overcurrent_trip_factor,
            current_limit_a * self.tuning.overcurrent_recovery_factor,
        );

        let mut next = self.faults;
        let bands = [
            (BatteryFault::Overvoltage, profile.cell_overvoltage, cell_voltage_v),
            (BatteryFault::Undervoltage, profile.cell_undervoltage, cell_voltage_v),
            (BatteryFault::Overcurrent, overcurrent, current_a.abs()),
            (
                BatteryFault::Overtemperature,
                profile.overtemperature,
                snapshot.battery_temperature_c,
            ),
        ];
        for (fault, band, value) in bands {
            if band.evaluate(next.contains(fault), value) {
                next.insert(fault);
            } else {
                next.remove(fault);
            }
        }

        let newly_tripped: Vec<BatteryFault> =
            next.iter().filter(|f| !self.faults.contains(*f)).collect();
        self.faults = next;

        if self.state == BatteryState::Maintenance {
            return FaultCheck::Persistent;
        }

        if !newly_tripped.is_empty() {
            let reason = describe_faults(&newly_tripped, cell_voltage_v, current_a, snapshot);
            if self.fault_since.is_none() {
                self.fault_since = Some(now);
            }
            self.fault_reason = Some(reason.clone());

            if self.clear_attempts >= self.tuning.max_clear_attempts {
                warn!(
                    reason = %reason,
                    clear_attempts = self.clear_attempts,
                    "battery fault keeps recurring, entering maintenance"
                );
                self.transition(BatteryState::Maintenance);
                return FaultCheck::Persistent;
            }

            if self.state != BatteryState::Fault {
                warn!(
                    reason = %reason,
                    previous_state = %self.state,
                    faults = self.faults.bits(),
                    "battery fault tripped"
                );
                self.transition(BatteryState::Fault);
                self.absorption_started = None;
                self.equalize_started = None;
            }
            return FaultCheck::Tripped;
        }

        if !self.faults.is_empty() {
            return FaultCheck::Active;
        }

        if self.state == BatteryState::Fault {
            let resume = match self.previous_state {
                BatteryState::Fault | BatteryState::Maintenance => BatteryState::Idle,
                other => other,
            };
            self.clear_attempts += 1;
            self.last_fault_cleared = Some(now);
            self.fault_since = None;
            self.fault_reason = None;
            self.transition(resume);
            info!(
                state = %self.state,
                clear_attempts = self.clear_attempts,
                "battery faults cleared"
            );
            return FaultCheck::Cleared;
        }

        FaultCheck::Healthy
    }

    /// Operator reset out of Maintenance
    ///
    /// Returns false when the pack was not in Maintenance.
    pub fn acknowledge_maintenance(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != BatteryState::Maintenance {
            return false;
        }
        self.clear_attempts = 0;
        self.last_fault_cleared = Some(now);
        let next = if self.faults.is_empty() {
            self.fault_since = None;
            self.fault_reason = None;
            BatteryState::Idle
        } else {
            BatteryState::Fault
        };
        self.transition(next);
        info!(state = %self.state, "battery maintenance acknowledged");
        true
    }

    /// Hysteretic cooling and heating control from the last measured temperature
    pub fn manage_thermal(&mut self) {
        let t = self.temperature_c;
        let tuning = &self.tuning;

        if !self.cooling_active && t > tuning.cooling_on_c {
            self.cooling_active = true;
            info!(temperature_c = t, "battery cooling on");
        } else if self.cooling_active && t < tuning.cooling_off_c {
            self.cooling_active = false;
            info!(temperature_c = t, "battery cooling off");
        }

        if !self.heating_active && t < tuning.heating_on_c {
            self.heating_active = true;
            info!(temperature_c = t, "battery heating on");
        } else if self.heating_active && t > tuning.heating_off_c {
            self.heating_active = false;
            info!(temperature_c = t, "battery heating off");
        }
    }

    /// Forget past clears once the pack has stayed fault-free long enough
    fn decay_clear_attempts(&mut self, now: DateTime<Utc>) {
        if self.clear_attempts == 0 || !self.faults.is_empty() {
            return;
        }
        if let Some(cleared) = self.last_fault_cleared {
            let quiet_s = (now - cleared).num_milliseconds() as f64 / 1000.0;
            if quiet_s >= self.tuning.clear_attempt_reset_s {
                self.clear_attempts = 0;
            }
        }
    }
}

fn describe_faults(
    faults: &[BatteryFault],
    cell_voltage_v: f64,
    current_a: f64,
    snapshot: &MeasurementSnapshot,
) -> String {
    faults
        .iter()
        .map(|fault| match fault {
            BatteryFault::Overvoltage => format!("overvoltage ({:.3} V/cell)", cell_voltage_v),
            BatteryFault::Undervoltage => format!("undervoltage ({:.3} V/cell)", cell_voltage_v),
            BatteryFault::Overcurrent => format!("overcurrent ({:.1} A)", current_a),
            BatteryFault::Overtemperature => {
                format!("overtemperature ({:.1} °C)", snapshot.battery_temperature_c)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
