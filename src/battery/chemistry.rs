//! Chemistry-specific battery characteristics
//!
//! Open-circuit-voltage curves, protection thresholds and temperature
//! derating curves, all expressed per cell.

use crate::battery::protection::HysteresisBand;
use crate::domain::BatteryChemistry;

/// Rest voltage per cell (V) against SOC (%), ascending in voltage
const LFP_OCV: &[(f64, f64)] = &[
    (2.80, 0.0),
    (3.00, 5.0),
    (3.20, 10.0),
    (3.25, 20.0),
    (3.28, 30.0),
    (3.30, 40.0),
    (3.31, 50.0),
    (3.32, 60.0),
    (3.33, 70.0),
    (3.34, 80.0),
    (3.37, 90.0),
    (3.45, 95.0),
    (3.60, 100.0),
];

const NMC_OCV: &[(f64, f64)] = &[
    (3.00, 0.0),
    (3.45, 5.0),
    (3.55, 10.0),
    (3.62, 20.0),
    (3.68, 30.0),
    (3.73, 40.0),
    (3.78, 50.0),
    (3.84, 60.0),
    (3.91, 70.0),
    (3.98, 80.0),
    (4.07, 90.0),
    (4.20, 100.0),
];

const LEAD_ACID_OCV: &[(f64, f64)] = &[
    (1.75, 0.0),
    (1.93, 10.0),
    (1.96, 20.0),
    (1.98, 30.0),
    (2.00, 40.0),
    (2.02, 50.0),
    (2.04, 60.0),
    (2.06, 70.0),
    (2.08, 80.0),
    (2.10, 90.0),
    (2.12, 100.0),
];

pub fn ocv_table(chemistry: BatteryChemistry) -> &'static [(f64, f64)] {
    match chemistry {
        BatteryChemistry::Lfp => LFP_OCV,
        BatteryChemistry::Nmc => NMC_OCV,
        BatteryChemistry::LeadAcid => LEAD_ACID_OCV,
    }
}

/// Map a rest cell voltage to SOC by linear interpolation
///
/// Voltages outside the table clamp to its end points.
pub fn soc_from_cell_voltage(chemistry: BatteryChemistry, cell_voltage_v: f64) -> f64 {
    let table = ocv_table(chemistry);
    let (first_v, first_soc) = table[0];
    let (last_v, last_soc) = table[table.len() - 1];

    if cell_voltage_v <= first_v {
        return first_soc;
    }
    if cell_voltage_v >= last_v {
        return last_soc;
    }

    table
        .windows(2)
        .find(|w| cell_voltage_v <= w[1].0)
        .map(|w| {
            let (v0, s0) = w[0];
            let (v1, s1) = w[1];
            s0 + (cell_voltage_v - v0) * (s1 - s0) / (v1 - v0)
        })
        .unwrap_or(last_soc)
}

/// Inverse of `soc_from_cell_voltage`: rest cell voltage for a given SOC
pub fn cell_voltage_from_soc(chemistry: BatteryChemistry, soc_percent: f64) -> f64 {
    let table = ocv_table(chemistry);
    let soc = soc_percent.clamp(0.0, 100.0);
    table
        .windows(2)
        .find(|w| soc <= w[1].1)
        .map(|w| {
            let (v0, s0) = w[0];
            let (v1, s1) = w[1];
            v0 + (soc - s0) * (v1 - v0) / (s1 - s0)
        })
        .unwrap_or(table[table.len() - 1].0)
}

/// Power scaling against temperature
///
/// Full power between `full_low_c` and `full_high_c`, falling linearly to zero
/// at `cutoff_low_c` and `cutoff_high_c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerateCurve {
    pub cutoff_low_c: f64,
    pub full_low_c: f64,
    pub full_high_c: f64,
    pub cutoff_high_c: f64,
}

impl DerateCurve {
    pub fn factor(&self, temperature_c: f64) -> f64 {
        if temperature_c <= self.cutoff_low_c || temperature_c >= self.cutoff_high_c {
            0.0
        } else if temperature_c < self.full_low_c {
            (temperature_c - self.cutoff_low_c) / (self.full_low_c - self.cutoff_low_c)
        } else if temperature_c > self.full_high_c {
            (self.cutoff_high_c - temperature_c) / (self.cutoff_high_c - self.full_high_c)
        } else {
            1.0
        }
    }
}

/// Protection and derating limits for one chemistry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChemistryProfile {
    pub cell_overvoltage: HysteresisBand,
    pub cell_undervoltage: HysteresisBand,
    pub overtemperature: HysteresisBand,
    pub charge_derate: DerateCurve,
    pub discharge_derate: DerateCurve,
}

pub fn profile(chemistry: BatteryChemistry) -> ChemistryProfile {
    match chemistry {
        BatteryChemistry::Lfp => ChemistryProfile {
            cell_overvoltage: HysteresisBand::rising(3.75, 3.55),
            cell_undervoltage: HysteresisBand::falling(2.50, 2.90),
            overtemperature: HysteresisBand::rising(60.0, 50.0),
            charge_derate: DerateCurve {
                cutoff_low_c: 0.0,
                full_low_c: 10.0,
                full_high_c: 35.0,
                cutoff_high_c: 50.0,
            },
            discharge_derate: DerateCurve {
                cutoff_low_c: -20.0,
                full_low_c: 0.0,
                full_high_c: 45.0,
                cutoff_high_c: 60.0,
            },
        },
        BatteryChemistry::Nmc => ChemistryProfile {
            cell_overvoltage: HysteresisBand::rising(4.25, 4.15),
            cell_undervoltage: HysteresisBand::falling(2.80, 3.30),
            overtemperature: HysteresisBand::rising(55.0, 45.0),
            charge_derate: DerateCurve {
                cutoff_low_c: 0.0,
                full_low_c: 10.0,
                full_high_c: 40.0,
                cutoff_high_c: 50.0,
            },
            discharge_derate: DerateCurve {
                cutoff_low_c: -20.0,
                full_low_c: 0.0,
                full_high_c: 45.0,
                cutoff_high_c: 60.0,
            },
        },
        BatteryChemistry::LeadAcid => ChemistryProfile {
            cell_overvoltage: HysteresisBand::rising(2.60, 2.45),
            cell_undervoltage: HysteresisBand::falling(1.70, 1.90),
            overtemperature: HysteresisBand::rising(55.0, 45.0),
            charge_derate: DerateCurve {
                cutoff_low_c: 0.0,
                full_low_c: 5.0,
                full_high_c: 35.0,
                cutoff_high_c: 50.0,
            },
            discharge_derate: DerateCurve {
                cutoff_low_c: -20.0,
                full_low_c: -5.0,
                full_high_c: 40.0,
                cutoff_high_c: 55.0,
            },
        },
    }
}
