//! Mutation operators.
//!
//! All randomness used by the evolution engine comes from a [`Mutator`],
//! which can be seeded so a run of mutations is reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::genome::ParamValue;

/// Bounds applied when perturbing skill parameters.
pub const SKILL_PARAM_MIN: f64 = -10_000.0;
pub const SKILL_PARAM_MAX: f64 = 10_000.0;

/// Bounds applied when perturbing strategy parameters.
pub const STRATEGY_PARAM_MIN: f64 = -1_000.0;
pub const STRATEGY_PARAM_MAX: f64 = 1_000.0;

/// Perturb `value` by `value * rate * 0.1` in a random direction, clamped
/// to `[min, max]`.
///
/// This is a local step, not a resample: even a rate of 1.0 only moves the
/// value by a tenth of itself. The result is always inside `[min, max]`
/// when `min <= max`, NaN input included.
pub fn mutate_float<R: Rng + ?Sized>(
    rng: &mut R,
    value: f64,
    rate: f64,
    min: f64,
    max: f64,
) -> f64 {
    let mut delta = value * rate * 0.1;
    if rng.gen_bool(0.5) {
        delta = -delta;
    }
    let result = value + delta;
    // NaN input lands on `min`
    result.max(min).min(max)
}

/// Source of mutation randomness for the engine.
pub struct Mutator {
    rng: StdRng,
}

impl Mutator {
    /// Deterministic mutator: the same seed yields the same mutations.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn mutate_float(&mut self, value: f64, rate: f64, min: f64, max: f64) -> f64 {
        mutate_float(&mut self.rng, value, rate, min, max)
    }

    /// Mutate a single skill parameter according to its variant.
    ///
    /// Floats and integers are perturbed within the skill bounds (integers
    /// truncated back), booleans flip with probability `rate`, anything else
    /// is passed through unchanged.
    pub fn mutate_param(&mut self, value: &ParamValue, rate: f64) -> ParamValue {
        match value {
            ParamValue::Float(v) => ParamValue::Float(self.mutate_float(
                *v,
                rate,
                SKILL_PARAM_MIN,
                SKILL_PARAM_MAX,
            )),
            ParamValue::Int(v) => ParamValue::Int(self.mutate_float(
                *v as f64,
                rate,
                SKILL_PARAM_MIN,
                SKILL_PARAM_MAX,
            ) as i64),
            ParamValue::Bool(b) => {
                let p = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
                if self.rng.gen_bool(p) {
                    ParamValue::Bool(!b)
                } else {
                    ParamValue::Bool(*b)
                }
            }
            other => other.clone(),
        }
    }
}

impl Default for Mutator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
