//! Charge/discharge decisions and charge-stage progression
//!
//! Bulk runs at whatever the surplus and derated ceiling allow. Absorption
//! ramps down over a fixed window and hands over to Float. Float trickles at
//! a small fraction of the ceiling until the pack sags back into the bulk
//! region. Equalize is operator-initiated and lead-acid only.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::battery::chemistry;
use crate::domain::{BatteryChemistry, BatteryPack, BatteryState, ChargeStage};

impl BatteryPack {
    /// Decide the charge power for this cycle
    ///
    /// `available_w` is generation, `load_w` is consumption. Returns the charge
    /// power in watts (0 when not charging).
    pub fn manage_charging(&mut self, available_w: f64, load_w: f64, now: DateTime<Utc>) -> f64 {
        if self.state.is_locked_out() {
            return 0.0;
        }

        let soc = self.soc.smoothed;
        let surplus_w = available_w - load_w;
        let critical = self.is_critically_low();
        let threshold_w = if critical {
            self.tuning.emergency_charge_surplus_w
        } else {
            self.tuning.min_charge_surplus_w
        };
        // An absorbing pack that reaches the limit hands over to Float instead of idling
        let keeps_topping = match self.state.charge_stage() {
            Some(ChargeStage::Float) | Some(ChargeStage::Equalize) => true,
            Some(ChargeStage::Absorption) => soc >= self.tuning.absorption_limit_soc,
            _ => false,
        } || self.equalize_requested;

        let should_charge = surplus_w > threshold_w && (soc < self.tuning.max_soc || keeps_topping);
        if !should_charge {
            self.stop_charging();
            return 0.0;
        }

        let stage = self.select_stage(soc, now);
        let ceiling_w = self.max_charge_power_w();
        let mut power_w = match stage {
            ChargeStage::Bulk => ceiling_w,
            ChargeStage::Absorption => ceiling_w * self.absorption_factor(now),
            ChargeStage::Float => ceiling_w * self.tuning.float_power_fraction,
            ChargeStage::Equalize => ceiling_w * self.tuning.equalize_power_fraction,
        }
        .min(surplus_w);

        if critical {
            power_w = power_w.max(self.tuning.emergency_charge_w.min(surplus_w));
        }
        if power_w <= 0.0 {
            self.stop_charging();
            return 0.0;
        }

        if self.state != BatteryState::Charging(stage) {
            info!(
                from = %self.state,
                to = %BatteryState::Charging(stage),
                soc_percent = soc,
                power_w,
                "battery charge stage change"
            );
        }
        self.transition(BatteryState::Charging(stage));
        power_w
    }

    /// Decide the discharge power for this cycle
    ///
    /// Returns the discharge power in watts as a positive number.
    pub fn manage_discharging(&mut self, load_w: f64, grid_available: bool) -> f64 {
        if self.state.is_locked_out() {
            return 0.0;
        }

        let soc = self.soc.smoothed;
        let t = self.tuning.clone();
        let wanted = load_w > t.min_discharge_load_w
            && (!grid_available || (t.peak_shaving_enabled && soc > t.peak_shave_soc));
        if !wanted {
            if self.state == BatteryState::Discharging {
                self.transition(BatteryState::Idle);
            }
            return 0.0;
        }

        let headroom = ((soc - t.min_soc) / t.discharge_headroom_band).clamp(0.0, 1.0);
        let mut power_w = load_w.min(self.max_discharge_power_w()) * headroom;

        if power_w > 0.0 {
            let to_floor_wh = self.capacity_nominal_wh * (soc - t.min_soc).max(0.0) / 100.0;
            let minutes_to_floor = to_floor_wh / power_w * 60.0;
            if minutes_to_floor < t.min_time_to_floor_min {
                power_w *= minutes_to_floor / t.min_time_to_floor_min;
            }
        }

        if power_w <= 0.0 {
            if matches!(self.state, BatteryState::Discharging | BatteryState::Charging(_)) {
                self.transition(BatteryState::Idle);
            }
            self.absorption_started = None;
            return 0.0;
        }

        if self.state != BatteryState::Discharging {
            debug!(soc_percent = soc, power_w, "battery discharging");
        }
        self.transition(BatteryState::Discharging);
        self.absorption_started = None;
        self.equalize_started = None;
        power_w
    }

    /// Temperature-derated charge ceiling
    ///
    /// Below the critical SOC the ceiling never drops under the emergency fraction
    /// of the rated power, even outside the temperature band.
    pub fn max_charge_power_w(&self) -> f64 {
        let rated = self.rated_charge_power_w();
        let derated = rated * chemistry::profile(self.chemistry).charge_derate.factor(self.temperature_c);
        if self.is_critically_low() {
            derated.max(rated * self.tuning.emergency_charge_fraction)
        } else {
            derated
        }
    }

    pub fn max_discharge_power_w(&self) -> f64 {
        self.rated_discharge_power_w()
            * chemistry::profile(self.chemistry)
                .discharge_derate
                .factor(self.temperature_c)
    }

    /// Ask for an equalization charge on the next charging cycle
    ///
    /// Only accepted for lead-acid packs that are already at the absorption limit.
    pub fn request_equalize(&mut self) -> bool {
        if self.chemistry != BatteryChemistry::LeadAcid
            || self.state.is_locked_out()
            || self.soc.smoothed < self.tuning.absorption_limit_soc
        {
            return false;
        }
        self.equalize_requested = true;
        info!(soc_percent = self.soc.smoothed, "equalization requested");
        true
    }

    /// Drop any charge or discharge stage and clear the stage timers
    ///
    /// Fault and Maintenance are left as they are.
    pub fn halt(&mut self) {
        self.stop_charging();
    }

    fn select_stage(&mut self, soc: f64, now: DateTime<Utc>) -> ChargeStage {
        let t = &self.tuning;

        if self.equalize_requested && self.state.charge_stage() != Some(ChargeStage::Equalize) {
            self.equalize_requested = false;
            self.equalize_started = Some(now);
            return ChargeStage::Equalize;
        }

        match self.state.charge_stage() {
            Some(ChargeStage::Equalize) => {
                let started = *self.equalize_started.get_or_insert(now);
                if elapsed_s(started, now) >= t.equalize_duration_s {
                    self.equalize_started = None;
                    ChargeStage::Float
                } else {
                    ChargeStage::Equalize
                }
            }
            Some(ChargeStage::Float) => {
                if soc < t.bulk_limit_soc - t.float_fallback_points {
                    self.absorption_started = None;
                    ChargeStage::Bulk
                } else {
                    ChargeStage::Float
                }
            }
            _ => {
                if soc < t.bulk_limit_soc {
                    self.absorption_started = None;
                    ChargeStage::Bulk
                } else if soc < t.absorption_limit_soc {
                    let started = *self.absorption_started.get_or_insert(now);
                    if elapsed_s(started, now) >= t.absorption_duration_s {
                        self.absorption_started = None;
                        ChargeStage::Float
                    } else {
                        ChargeStage::Absorption
                    }
                } else {
                    self.absorption_started = None;
                    ChargeStage::Float
                }
            }
        }
    }

    /// Linear ramp from full power to the floor over the absorption window
    fn absorption_factor(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = self
            .absorption_started
            .map(|started| elapsed_s(started, now))
            .unwrap_or(0.0);
        (1.0 - elapsed / self.tuning.absorption_duration_s).max(self.tuning.absorption_floor)
    }

    fn stop_charging(&mut self) {
        if matches!(self.state, BatteryState::Charging(_) | BatteryState::Discharging) {
            debug!(from = %self.state, "battery idle");
            self.transition(BatteryState::Idle);
        }
        self.absorption_started = None;
        self.equalize_started = None;
    }
}

fn elapsed_s(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - since).num_milliseconds() as f64 / 1000.0).max(0.0)
}
