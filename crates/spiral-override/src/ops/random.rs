// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::math::{add, cast, ceil, floor, less, mul, sub};
use crate::error::{OverrideError, OverrideResult};
use crate::graph::primitive::RandomUniform;
use crate::value::{DType, Value};

/// Stochastic rounding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundingMode {
    /// Floor or ceil with equal probability.
    Naive,
    /// Round up with probability equal to the fractional part.
    Ulp,
}

impl FromStr for RoundingMode {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(RoundingMode::Naive),
            "ulp" => Ok(RoundingMode::Ulp),
            other => Err(OverrideError::config(format!(
                "unrecognised stochastic rounding mode {other:?} (expected \"naive\" or \"ulp\")"
            ))),
        }
    }
}

impl fmt::Display for RoundingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoundingMode::Naive => "naive",
            RoundingMode::Ulp => "ulp",
        })
    }
}

/// Uniform samples in `[0, 1)` shaped like `like`. Symbolic values get a
/// sampling node that draws fresh numbers on every evaluation.
pub fn random_uniform(like: &Value, rng: &mut StdRng) -> OverrideResult<Value> {
    Ok(match like {
        Value::Constant(_) => Value::Constant(rng.gen::<f64>()),
        Value::Array(array) => Value::Array(ArrayD::from_shape_fn(IxDyn(array.shape()), |_| {
            rng.gen::<f32>()
        })),
        Value::Symbolic(tensor) => {
            let node = RandomUniform::new(tensor.shape().to_vec(), StdRng::seed_from_u64(rng.gen()));
            Value::Symbolic(tensor.graph().apply(node, &[])?)
        }
    })
}

/// Picks `floor(x)` or `ceil(x)` at random, so integers are left as they
/// are. Floor and ceil are straight-through and their difference carries no
/// gradient, giving the symbolic form an identity gradient.
pub fn stochastic_round(value: &Value, mode: RoundingMode, rng: &mut StdRng) -> OverrideResult<Value> {
    let lower = floor(value)?;
    let upper = ceil(value)?;
    let noise = random_uniform(value, rng)?;
    let threshold = match mode {
        RoundingMode::Naive => Value::Constant(0.5),
        RoundingMode::Ulp => sub(value, &lower)?,
    };
    let up = cast(&less(&noise, &threshold)?, DType::Float)?;
    add(&lower, &mul(&up, &sub(&upper, &lower)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use ndarray::array;

    #[test]
    fn unknown_modes_are_configuration_errors() {
        assert_eq!("ulp".parse::<RoundingMode>().unwrap(), RoundingMode::Ulp);
        assert!(matches!(
            "nearest".parse::<RoundingMode>(),
            Err(OverrideError::Configuration { .. })
        ));
    }

    #[test]
    fn integers_are_left_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = Value::from(array![-2.0f32, 0.0, 3.0].into_dyn());
        for mode in [RoundingMode::Naive, RoundingMode::Ulp] {
            let out = stochastic_round(&x, mode, &mut rng).unwrap();
            assert_eq!(out.evaluate().unwrap(), array![-2.0f32, 0.0, 3.0].into_dyn());
        }
    }

    #[test]
    fn naive_rounding_only_moves_fractional_entries() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = Value::from(ArrayD::from_elem(IxDyn(&[1000]), 3.0f32));
        let out = stochastic_round(&x, RoundingMode::Naive, &mut rng).unwrap();
        assert!(out.evaluate().unwrap().iter().all(|&v| v == 3.0));

        let halves = Value::from(ArrayD::from_elem(IxDyn(&[1000]), 2.25f32));
        let out = stochastic_round(&halves, RoundingMode::Naive, &mut rng).unwrap();
        let out = out.evaluate().unwrap();
        assert!(out.iter().all(|&v| v == 2.0 || v == 3.0));
        let ups = out.iter().filter(|&&v| v == 3.0).count();
        assert!((400..600).contains(&ups), "{ups} of 1000 rounded up");
    }

    #[test]
    fn symbolic_rounding_resamples_and_passes_gradient() {
        let graph = Graph::new();
        let w = graph.variable("w", ArrayD::from_elem(IxDyn(&[256]), 0.5f32), true);
        let mut rng = StdRng::seed_from_u64(11);
        let out = stochastic_round(&Value::from(w.clone()), RoundingMode::Ulp, &mut rng).unwrap();
        let tensor = out.as_tensor().unwrap();
        let first = tensor.eval().unwrap();
        assert!(first.iter().all(|&v| v == 0.0 || v == 1.0));
        assert!(first.iter().any(|&v| v == 0.0) && first.iter().any(|&v| v == 1.0));
        let grads = graph.gradients(tensor, &[&w]).unwrap();
        assert!(grads[0].iter().all(|&g| g == 1.0));
    }
}
