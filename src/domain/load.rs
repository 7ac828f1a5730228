use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Load priority, ordered from most to least important
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadPriority {
    /// Refrigeration, medical equipment; never shed
    Critical,
    /// Lighting, communications
    High,
    /// Comfort loads such as HVAC
    Medium,
    /// Deferrable loads such as water heating
    Low,
    NonEssential,
}

/// Controlled state of a load
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LoadState {
    On,
    Shed,
}

/// A controllable load as seen by the load shedding engine
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoadDefinition {
    #[validate(length(min = 1, max = 32))]
    pub id: String,
    #[validate(range(min = 0.0))]
    pub rated_power_w: f64,
    pub priority: LoadPriority,
    #[serde(default)]
    pub deferrable: bool,
    #[serde(default = "default_sheddable")]
    pub sheddable: bool,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_on_s: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_off_s: f64,
    #[serde(default, skip_deserializing)]
    pub last_state_change: Option<DateTime<Utc>>,
    #[serde(skip_deserializing, default = "default_state")]
    pub state: LoadState,
}

fn default_sheddable() -> bool {
    true
}

fn default_state() -> LoadState {
    LoadState::On
}

impl LoadDefinition {
    pub fn new(id: impl Into<String>, rated_power_w: f64, priority: LoadPriority) -> Self {
        Self {
            id: id.into(),
            rated_power_w,
            priority,
            deferrable: false,
            sheddable: priority != LoadPriority::Critical,
            min_on_s: 0.0,
            min_off_s: 0.0,
            last_state_change: None,
            state: LoadState::On,
        }
    }

    pub fn is_on(&self) -> bool {
        self.state == LoadState::On
    }

    pub fn is_shed(&self) -> bool {
        self.state == LoadState::Shed
    }

    /// Whether min-on / min-off timing allows the load to change state now
    pub fn timing_allows_change(&self, now: DateTime<Utc>) -> bool {
        let Some(changed) = self.last_state_change else {
            return true;
        };
        let elapsed_s = (now - changed).num_milliseconds() as f64 / 1000.0;
        let required_s = match self.state {
            LoadState::On => self.min_on_s,
            LoadState::Shed => self.min_off_s,
        };
        elapsed_s >= required_s
    }

    /// Seconds spent in the current state, `None` if it never changed
    pub fn time_in_state_s(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_state_change
            .map(|changed| (now - changed).num_milliseconds() as f64 / 1000.0)
    }

    pub(crate) fn set_state(&mut self, state: LoadState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.last_state_change = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_ordering() {
        assert!(LoadPriority::Critical < LoadPriority::High);
        assert!(LoadPriority::Low < LoadPriority::NonEssential);
    }

    #[test]
    fn test_critical_loads_default_to_unsheddable() {
        let fridge = LoadDefinition::new("fridge", 150.0, LoadPriority::Critical);
        assert!(!fridge.sheddable);
        let pool = LoadDefinition::new("pool_pump", 800.0, LoadPriority::NonEssential);
        assert!(pool.sheddable);
    }

    #[test]
    fn test_timing_constraints() {
        let now = Utc::now();
        let mut load = LoadDefinition::new("heater", 2000.0, LoadPriority::Low);
        load.min_on_s = 60.0;
        load.min_off_s = 120.0;
        assert!(load.timing_allows_change(now));

        load.last_state_change = Some(now - Duration::seconds(30));
        assert!(!load.timing_allows_change(now));
        load.last_state_change = Some(now - Duration::seconds(60));
        assert!(load.timing_allows_change(now));

        load.set_state(LoadState::Shed, now);
        assert!(!load.timing_allows_change(now + Duration::seconds(119)));
        assert!(load.timing_allows_change(now + Duration::seconds(120)));
    }
}
