// MIT License
// Copyright 2023--present potserve developers

//! Reference pairwise Lennard-Jones potential.
//!
//! `φ(r) = 4ε[(σ/r)¹² − (σ/r)⁶]`. The energy counts half of every pair
//! interaction for each contributing atom, so a pair between a contributing
//! and a padding atom contributes `φ/2` and two padding atoms contribute
//! nothing. Forces are the exact negative gradient of that energy.

use serde::Deserialize;

use crate::error::{HandlerError, ReloadError};
use crate::potential::{Evaluation, ForceInput, PotentialHandler};

/// Helium-helium well depth in eV.
pub const DEFAULT_EPSILON: f64 = 0.00088;

/// Helium-helium zero crossing in Å.
pub const DEFAULT_SIGMA: f64 = 2.551;

/// Parameters as they appear in a model file's `[parameters]` table.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LennardJonesParams {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    #[serde(default)]
    pub cutoff: Option<f64>,
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

fn default_sigma() -> f64 {
    DEFAULT_SIGMA
}

impl Default for LennardJonesParams {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            sigma: DEFAULT_SIGMA,
            cutoff: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LennardJones {
    params: LennardJonesParams,
}

impl LennardJones {
    pub const KIND: &'static str = "lennard-jones";

    pub fn new(params: LennardJonesParams) -> Result<Self, ReloadError> {
        let invalid = |message: String| ReloadError::InvalidParameters {
            kind: Self::KIND.to_string(),
            message,
        };
        if !params.epsilon.is_finite() {
            return Err(invalid(format!("epsilon must be finite, got {}", params.epsilon)));
        }
        if !(params.sigma.is_finite() && params.sigma > 0.0) {
            return Err(invalid(format!("sigma must be positive, got {}", params.sigma)));
        }
        if let Some(rc) = params.cutoff {
            if !(rc.is_finite() && rc > 0.0) {
                return Err(invalid(format!("cutoff must be positive, got {rc}")));
            }
        }
        Ok(Self { params })
    }

    /// Build from a TOML parameter table; missing keys take the defaults.
    pub fn from_table(table: &toml::Table) -> Result<Self, ReloadError> {
        let params = LennardJonesParams::deserialize(toml::Value::Table(table.clone())).map_err(|e| {
            ReloadError::InvalidParameters {
                kind: Self::KIND.to_string(),
                message: e.to_string(),
            }
        })?;
        Self::new(params)
    }

    pub fn params(&self) -> &LennardJonesParams {
        &self.params
    }

    /// Pair energy and `dφ/dr` at separation `r`.
    fn pair(&self, r: f64) -> (f64, f64) {
        let sr6 = (self.params.sigma / r).powi(6);
        let sr12 = sr6 * sr6;
        let eps = self.params.epsilon;
        (4.0 * eps * (sr12 - sr6), 24.0 * eps * (sr6 - 2.0 * sr12) / r)
    }
}

impl PotentialHandler for LennardJones {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn compute(&self, input: &ForceInput<'_>) -> Result<Evaluation, HandlerError> {
        let n = input.n_atoms();
        if input.positions.len() != n {
            return Err(HandlerError::Compute(format!(
                "{} positions for {n} atoms",
                input.positions.len()
            )));
        }

        let mut eval = Evaluation::zeros(n);
        let cutoff = self.params.cutoff.unwrap_or(f64::INFINITY);

        for i in 0..n {
            for j in (i + 1)..n {
                let weight = 0.5
                    * (u8::from(input.is_contributing(i)) + u8::from(input.is_contributing(j))) as f64;
                if weight == 0.0 {
                    continue;
                }
                let d = [
                    input.positions[i][0] - input.positions[j][0],
                    input.positions[i][1] - input.positions[j][1],
                    input.positions[i][2] - input.positions[j][2],
                ];
                let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                if r == 0.0 {
                    return Err(HandlerError::Compute(format!("atoms {i} and {j} overlap")));
                }
                if r > cutoff {
                    continue;
                }

                let (phi, dphi) = self.pair(r);
                eval.energy += weight * phi;
                for k in 0..3 {
                    let f = -weight * dphi * d[k] / r;
                    eval.forces[i][k] += f;
                    eval.forces[j][k] -= f;
                }
            }
        }
        Ok(eval)
    }
}
