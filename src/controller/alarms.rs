use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::{info, warn};

use crate::domain::{Alarm, Warning};

/// A status code that occupies one bit of a status bitmask
pub trait StatusCode: Copy + Ord + Display {
    const KIND: &'static str;
    fn bit(self) -> u32;
}

impl StatusCode for Alarm {
    const KIND: &'static str = "alarm";
    fn bit(self) -> u32 {
        Alarm::bit(self)
    }
}

impl StatusCode for Warning {
    const KIND: &'static str = "warning";
    fn bit(self) -> u32 {
        Warning::bit(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatchedCode {
    pub description: String,
    pub raised_at: DateTime<Utc>,
}

/// Edge-triggered set of active codes
///
/// Each code keeps the description and timestamp of its rising edge; only
/// edges are logged.
#[derive(Debug, Clone, Serialize)]
pub struct Latch<C: StatusCode> {
    active: BTreeMap<C, LatchedCode>,
}

pub type AlarmLatch = Latch<Alarm>;
pub type WarningLatch = Latch<Warning>;

impl<C: StatusCode> Default for Latch<C> {
    fn default() -> Self {
        Self {
            active: BTreeMap::new(),
        }
    }
}

impl<C: StatusCode> Latch<C> {
    /// Drive one code; returns true when its state changed
    pub fn update(&mut self, code: C, active: bool, description: &str, now: DateTime<Utc>) -> bool {
        match (active, self.active.contains_key(&code)) {
            (true, false) => {
                warn!(kind = C::KIND, code = %code, description, "raised");
                self.active.insert(
                    code,
                    LatchedCode {
                        description: description.to_string(),
                        raised_at: now,
                    },
                );
                true
            }
            (false, true) => {
                if let Some(latched) = self.active.remove(&code) {
                    let active_s = (now - latched.raised_at).num_seconds();
                    info!(kind = C::KIND, code = %code, active_s, "cleared");
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, code: C) -> bool {
        self.active.contains_key(&code)
    }

    pub fn get(&self, code: C) -> Option<&LatchedCode> {
        self.active.get(&code)
    }

    pub fn mask(&self) -> u32 {
        self.active.keys().fold(0, |mask, code| mask | code.bit())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&C, &LatchedCode)> {
        self.active.iter()
    }
}
