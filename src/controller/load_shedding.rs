//! Priority-based load shedding with restore and rotation
//!
//! Loads are shed least-important first and restored most-important first.
//! While shedding stays active for long periods the engine rotates which
//! loads are off so the same circuits do not stay dark indefinitely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, info};
use validator::Validate;

use crate::domain::{LoadDefinition, LoadPriority, LoadState};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SheddingConfig {
    /// Deficit that starts shedding (W)
    #[validate(range(min = 0.0))]
    pub min_deficit_w: f64,
    /// Shed this multiple of the deficit
    #[validate(range(min = 1.0, max = 3.0))]
    pub target_factor: f64,
    /// Surplus needed before shed loads come back (W)
    #[validate(range(min = 0.0))]
    pub restore_surplus_w: f64,
    /// A load must stay shed this long before rotation may restore it
    #[validate(range(min = 0.0))]
    pub min_shed_duration_s: f64,
    #[validate(range(min = 1.0))]
    pub rotation_interval_s: f64,
    /// Only shed while available power is below this ceiling; `None` disables the check
    pub shed_available_ceiling_w: Option<f64>,
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            min_deficit_w: 100.0,
            target_factor: 1.2,
            restore_surplus_w: 200.0,
            min_shed_duration_s: 60.0,
            rotation_interval_s: 300.0,
            shed_available_ceiling_w: None,
        }
    }
}

/// Power drawn by loads that are currently on
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadDemand {
    pub total_w: f64,
    pub critical_w: f64,
    pub deferrable_w: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadManager {
    loads: Vec<LoadDefinition>,
    config: SheddingConfig,
    critical_soc: f64,
    shedding_active: bool,
    shedding_started: Option<DateTime<Utc>>,
    rotation_started: Option<DateTime<Utc>>,
    shed_target_w: f64,
    /// Next load index the rotation search starts from
    rotation_cursor: usize,
    shed_event_count: u64,
    restore_event_count: u64,
}

impl LoadManager {
    pub fn new(loads: Vec<LoadDefinition>, config: SheddingConfig, critical_soc: f64) -> Self {
        Self {
            loads,
            config,
            critical_soc,
            shedding_active: false,
            shedding_started: None,
            rotation_started: None,
            shed_target_w: 0.0,
            rotation_cursor: 0,
            shed_event_count: 0,
            restore_event_count: 0,
        }
    }

    /// Run one shedding pass; returns whether any load changed state
    pub fn manage_shedding(
        &mut self,
        available_w: f64,
        demand_w: f64,
        soc_percent: f64,
        grid_available: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let deficit_w = demand_w - available_w;
        let mut changed = false;

        if deficit_w > self.config.min_deficit_w {
            if !self.shedding_active {
                self.shedding_active = true;
                self.shedding_started = Some(now);
                self.rotation_started = Some(now);
                self.shed_event_count += 1;
                info!(deficit_w, available_w, demand_w, "load shedding started");
            }

            let shed_everything = !grid_available && soc_percent < self.critical_soc;
            self.shed_target_w = if shed_everything {
                self.demand().total_w
            } else {
                deficit_w * self.config.target_factor
            };
            changed |= self.shed_until_target(available_w, now);
        } else if self.shedding_active && -deficit_w > self.config.restore_surplus_w {
            changed |= self.restore(-deficit_w, now);
        }

        if self.shedding_active {
            changed |= self.rotate(now);
        }

        changed
    }

    fn shed_until_target(&mut self, available_w: f64, now: DateTime<Utc>) -> bool {
        if let Some(ceiling_w) = self.config.shed_available_ceiling_w {
            if available_w >= ceiling_w {
                debug!(available_w, ceiling_w, "shedding suppressed above available-power ceiling");
                return false;
            }
        }

        let mut order: Vec<usize> = (0..self.loads.len()).collect();
        order.sort_by_key(|&i| Reverse(self.loads[i].priority));

        let mut shed_w = 0.0;
        let mut changed = false;
        for idx in order {
            if shed_w >= self.shed_target_w {
                break;
            }
            let load = &mut self.loads[idx];
            if load.is_on() && can_shed(load, now) {
                load.set_state(LoadState::Shed, now);
                shed_w += load.rated_power_w;
                changed = true;
                debug!(load = %load.id, priority = %load.priority, rated_power_w = load.rated_power_w, "load shed");
            }
        }
        changed
    }

    /// Bring shed loads back, most important first, while they fit the surplus
    fn restore(&mut self, surplus_w: f64, now: DateTime<Utc>) -> bool {
        let mut order: Vec<usize> = (0..self.loads.len()).collect();
        order.sort_by_key(|&i| self.loads[i].priority);

        let mut remaining_w = surplus_w;
        let mut changed = false;
        for idx in order {
            let load = &mut self.loads[idx];
            if load.is_shed() && load.timing_allows_change(now) && load.rated_power_w <= remaining_w {
                load.set_state(LoadState::On, now);
                remaining_w -= load.rated_power_w;
                self.restore_event_count += 1;
                changed = true;
                debug!(load = %load.id, remaining_w, "load restored");
            }
        }

        if !self.loads.iter().any(LoadDefinition::is_shed) {
            self.shedding_active = false;
            self.shedding_started = None;
            self.rotation_started = None;
            self.shed_target_w = 0.0;
            info!("load shedding ended, all loads restored");
        }
        changed
    }

    /// Swap one long-shed load for an equally large, no more important load that is still on
    fn rotate(&mut self, now: DateTime<Utc>) -> bool {
        let Some(started) = self.rotation_started else {
            self.rotation_started = Some(now);
            return false;
        };
        let active_s = (now - started).num_milliseconds() as f64 / 1000.0;
        if active_s <= self.config.rotation_interval_s {
            return false;
        }

        let n = self.loads.len();
        let mut changed = false;
        for step in 0..n {
            let i = (self.rotation_cursor + step) % n;
            let shed = &self.loads[i];
            let long_enough = shed.is_shed()
                && shed
                    .time_in_state_s(now)
                    .is_some_and(|s| s >= self.config.min_shed_duration_s);
            if !long_enough {
                continue;
            }

            // Never trade a shed load for a more important one; prefer the least important
            let needed_w = shed.rated_power_w;
            let floor = shed.priority;
            let replacement = (1..n)
                .map(|k| (i + k) % n)
                .filter(|&j| {
                    let candidate = &self.loads[j];
                    candidate.is_on()
                        && candidate.priority >= floor
                        && candidate.rated_power_w >= needed_w
                        && can_shed(candidate, now)
                })
                .min_by_key(|&j| Reverse(self.loads[j].priority));

            if let Some(j) = replacement {
                self.loads[i].set_state(LoadState::On, now);
                self.loads[j].set_state(LoadState::Shed, now);
                self.rotation_cursor = (i + 1) % n;
                info!(
                    restored = %self.loads[i].id,
                    shed = %self.loads[j].id,
                    "load shedding rotated"
                );
                changed = true;
                break;
            }
        }

        self.rotation_started = Some(now);
        changed
    }

    /// Power of the loads that are currently on
    pub fn demand(&self) -> LoadDemand {
        self.loads
            .iter()
            .filter(|l| l.is_on())
            .fold(LoadDemand::default(), |mut d, l| {
                d.total_w += l.rated_power_w;
                if l.priority == LoadPriority::Critical {
                    d.critical_w += l.rated_power_w;
                }
                if l.deferrable {
                    d.deferrable_w += l.rated_power_w;
                }
                d
            })
    }

    /// One flag per load in configuration order; true = shed
    pub fn shed_flags(&self) -> Vec<bool> {
        self.loads.iter().map(LoadDefinition::is_shed).collect()
    }

    pub fn loads(&self) -> &[LoadDefinition] {
        &self.loads
    }

    pub fn is_shedding_active(&self) -> bool {
        self.shedding_active
    }

    pub fn shed_target_w(&self) -> f64 {
        self.shed_target_w
    }

    pub fn shed_event_count(&self) -> u64 {
        self.shed_event_count
    }

    pub fn restore_event_count(&self) -> u64 {
        self.restore_event_count
    }
}

fn can_shed(load: &LoadDefinition, now: DateTime<Utc>) -> bool {
    load.sheddable && load.priority != LoadPriority::Critical && load.timing_allows_change(now)
}
