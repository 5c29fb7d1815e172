use crate::corpus::Seed;
use serde::Deserialize;
use thiserror::Error;

/// Default energy assigned to a seed whose every factor is maxed out.
pub const DEFAULT_ENERGY_BASE: u32 = 100;

/// Errors raised while building a [`PowerSchedule`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// A weight was negative or not finite, or all weights were zero.
    #[error("Invalid energy weights {0:?}: weights must be finite, non-negative and not all zero")]
    InvalidWeights(EnergyWeights),
}

/// Relative importance of each energy factor.
///
/// The defaults (40/30/20/10) are tunable starting points, not invariants.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnergyWeights {
    #[serde(default = "default_coverage_weight")]
    pub coverage: f64,
    #[serde(default = "default_time_weight")]
    pub time: f64,
    #[serde(default = "default_discovery_weight")]
    pub discovery: f64,
    #[serde(default = "default_age_weight")]
    pub age: f64,
}

fn default_coverage_weight() -> f64 {
    0.4
}
fn default_time_weight() -> f64 {
    0.3
}
fn default_discovery_weight() -> f64 {
    0.2
}
fn default_age_weight() -> f64 {
    0.1
}

impl Default for EnergyWeights {
    fn default() -> Self {
        Self {
            coverage: default_coverage_weight(),
            time: default_time_weight(),
            discovery: default_discovery_weight(),
            age: default_age_weight(),
        }
    }
}

impl EnergyWeights {
    fn as_array(&self) -> [f64; 4] {
        [self.coverage, self.time, self.discovery, self.age]
    }

    fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

/// The four normalized factors that feed a seed's energy, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyFactors {
    /// Share of the edge universe this seed discovered.
    pub coverage: f64,
    /// Favors fast seeds: `1 / (1 + avg_exec_seconds)`.
    pub time: f64,
    /// Favors seeds that led to crashes: `ln(1 + crashes_found)`.
    pub discovery: f64,
    /// Decays with use: `1 / (1 + ln(1 + times_fuzzed))`.
    pub age: f64,
}

impl EnergyFactors {
    /// Computes the clamped factors for `seed`.
    ///
    /// # Arguments
    /// * `seed`: The corpus entry being scored.
    /// * `edge_universe`: Denominator for the coverage factor. A value of `0`
    ///   yields a coverage factor of `0`.
    pub fn for_seed(seed: &Seed, edge_universe: u64) -> Self {
        let coverage = if edge_universe == 0 {
            0.0
        } else {
            seed.new_edges as f64 / edge_universe as f64
        };
        let time = 1.0 / (1.0 + seed.exec_time.as_secs_f64());
        let discovery = (1.0 + seed.crashes_found as f64).ln();
        let age = 1.0 / (1.0 + (1.0 + seed.times_fuzzed as f64).ln());
        Self {
            coverage: clamp_unit(coverage),
            time: clamp_unit(time),
            discovery: clamp_unit(discovery),
            age: clamp_unit(age),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Converts seed statistics into an integer scheduling priority ("energy").
///
/// `energy = base * Σ(wᵢ·fᵢ) / Σwᵢ`. With the default weights the divisor is 1,
/// which matches the plain weighted sum; normalizing keeps the result within
/// `[0, base]` for any valid weight vector.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSchedule {
    base: u32,
    weights: EnergyWeights,
}

impl Default for PowerSchedule {
    fn default() -> Self {
        Self {
            base: DEFAULT_ENERGY_BASE,
            weights: EnergyWeights::default(),
        }
    }
}

impl PowerSchedule {
    pub fn new(base: u32, weights: EnergyWeights) -> Result<Self, ScheduleError> {
        let all = weights.as_array();
        let valid = all.iter().all(|w| w.is_finite() && *w >= 0.0) && weights.sum() > 0.0;
        if !valid {
            return Err(ScheduleError::InvalidWeights(weights));
        }
        Ok(Self { base, weights })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn weights(&self) -> &EnergyWeights {
        &self.weights
    }

    /// Energy of `seed` given the current edge universe. Always in `[0, base]`.
    pub fn energy(&self, seed: &Seed, edge_universe: u64) -> u32 {
        let factors = EnergyFactors::for_seed(seed, edge_universe);
        self.energy_from_factors(&factors)
    }

    pub fn energy_from_factors(&self, factors: &EnergyFactors) -> u32 {
        let w = &self.weights;
        let weighted = w.coverage * factors.coverage
            + w.time * factors.time
            + w.discovery * factors.discovery
            + w.age * factors.age;
        let share = clamp_unit(weighted / w.sum());
        (self.base as f64 * share).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn seed_with(new_edges: usize, exec_ms: u64, crashes: u32, fuzzed: u32) -> Seed {
        Seed {
            id: 0,
            bytes: vec![0xAA],
            coverage_edges: (0..new_edges as u64).collect::<BTreeSet<_>>(),
            new_edges,
            exec_time: Duration::from_millis(exec_ms),
            exec_count: 1,
            crashes_found: crashes,
            times_fuzzed: fuzzed,
            created_at: 0,
        }
    }

    #[test]
    fn fresh_fast_seed_gets_time_and_age_credit() {
        let schedule = PowerSchedule::default();
        let seed = seed_with(0, 0, 0, 0);
        // time = 1.0, age = 1.0, coverage = 0, discovery = 0 -> 0.3 + 0.1
        assert_eq!(schedule.energy(&seed, 100), 40);
    }

    #[test]
    fn maxed_out_seed_reaches_base() {
        let schedule = PowerSchedule::default();
        let factors = EnergyFactors {
            coverage: 1.0,
            time: 1.0,
            discovery: 1.0,
            age: 1.0,
        };
        assert_eq!(schedule.energy_from_factors(&factors), DEFAULT_ENERGY_BASE);
    }

    #[test]
    fn discovery_factor_is_clamped_for_many_crashes() {
        let seed = seed_with(0, 0, 1_000, 0);
        let factors = EnergyFactors::for_seed(&seed, 10);
        assert_eq!(factors.discovery, 1.0);
    }

    #[test]
    fn age_factor_decays_with_times_fuzzed() {
        let young = EnergyFactors::for_seed(&seed_with(1, 10, 0, 0), 10);
        let old = EnergyFactors::for_seed(&seed_with(1, 10, 0, 50), 10);
        assert!(old.age < young.age);
        let schedule = PowerSchedule::default();
        assert!(
            schedule.energy(&seed_with(1, 10, 0, 50), 10)
                < schedule.energy(&seed_with(1, 10, 0, 0), 10)
        );
    }

    #[test]
    fn zero_edge_universe_gives_zero_coverage_factor() {
        let factors = EnergyFactors::for_seed(&seed_with(5, 0, 0, 0), 0);
        assert_eq!(factors.coverage, 0.0);
    }

    #[test]
    fn weights_are_normalized_when_they_exceed_one() {
        let weights = EnergyWeights {
            coverage: 4.0,
            time: 3.0,
            discovery: 2.0,
            age: 1.0,
        };
        let scaled = PowerSchedule::new(100, weights).unwrap();
        let seed = seed_with(3, 250, 2, 7);
        assert_eq!(
            scaled.energy(&seed, 20),
            PowerSchedule::default().energy(&seed, 20)
        );
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let negative = EnergyWeights {
            coverage: -0.1,
            ..EnergyWeights::default()
        };
        assert!(matches!(
            PowerSchedule::new(100, negative),
            Err(ScheduleError::InvalidWeights(_))
        ));
        let zero = EnergyWeights {
            coverage: 0.0,
            time: 0.0,
            discovery: 0.0,
            age: 0.0,
        };
        assert!(PowerSchedule::new(100, zero).is_err());
        let nan = EnergyWeights {
            age: f64::NAN,
            ..EnergyWeights::default()
        };
        assert!(PowerSchedule::new(100, nan).is_err());
    }
}
