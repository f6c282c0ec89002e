// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Binary and ternary quantizers.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;

use super::{choose, max_abs};
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::{density, Entries};
use crate::value::{DType, Value};

/// Mean magnitude without gradient; constants are their own magnitude.
fn detached_mean_abs(value: &Value) -> OverrideResult<Value> {
    let magnitude = ops::abs(&ops::stop_gradient(value)?)?;
    match magnitude {
        Value::Constant(_) => Ok(magnitude),
        other => ops::mean(&other, None, false),
    }
}

fn detached_max_abs(value: &Value) -> OverrideResult<Value> {
    let magnitude = ops::abs(&ops::stop_gradient(value)?)?;
    match magnitude {
        Value::Constant(_) => Ok(magnitude),
        other => ops::reduce_max(&other, None, false),
    }
}

/// BinaryConnect binarisation to `{-1, +1}`. The stochastic form rounds up
/// with hard-sigmoid probability. Gradients follow the hard-tanh
/// straight-through estimator.
#[derive(Debug, Clone)]
pub struct CourbariauxQuantizer {
    stochastic: bool,
    scale: bool,
    rng: Option<StdRng>,
}

impl CourbariauxQuantizer {
    pub fn new(stochastic: bool, scale: bool) -> Self {
        Self {
            stochastic,
            scale,
            rng: None,
        }
    }
}

impl Transform for CourbariauxQuantizer {
    fn kind(&self) -> &'static str {
        "CourbariauxQuantizer"
    }

    fn build(&mut self, scope: &Scope, _before: &Value) -> OverrideResult<()> {
        if self.stochastic {
            self.rng = Some(scope.rng("binarize"));
        }
        Ok(())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let one = Value::Constant(1.0);
        let minus_one = Value::Constant(-1.0);
        let binary = match (self.stochastic, self.rng.as_mut()) {
            (true, Some(rng)) => {
                let shifted = ops::div(&ops::add(value, &one)?, &Value::Constant(2.0))?;
                let probability =
                    ops::clip_by_value(&shifted, &Value::Constant(0.0), &one, false)?;
                let noise = ops::random_uniform(value, rng)?;
                choose(&ops::less(&noise, &probability)?, &one, &minus_one)?
            }
            _ => choose(
                &ops::greater_equal(value, &Value::Constant(0.0))?,
                &one,
                &minus_one,
            )?,
        };
        let forward = if self.scale {
            ops::mul(&binary, &detached_mean_abs(value)?)?
        } else {
            binary
        };
        let hard_tanh = ops::clip_by_value(value, &minus_one, &one, false)?;
        ops::straight_through(&ops::stop_gradient(&forward)?, &hard_tanh)
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(Entries::new()
            .with("stochastic", f64::from(u8::from(self.stochastic)))
            .with("scale", f64::from(u8::from(self.scale)))
            .finish())
    }

    fn reset(&mut self) {
        self.rng = None;
    }
}

/// Ternary quantizer with a fixed absolute threshold.
#[derive(Debug, Clone)]
pub struct DGQuantizer {
    threshold: f64,
}

impl DGQuantizer {
    pub fn new(threshold: f64) -> OverrideResult<Self> {
        if !(threshold >= 0.0 && threshold.is_finite()) {
            return Err(OverrideError::config(format!(
                "DGQuantizer: threshold must be a non-negative number, got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }
}

impl Transform for DGQuantizer {
    fn kind(&self) -> &'static str {
        "DGQuantizer"
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let keep = ops::greater(&ops::abs(value)?, &Value::Constant(self.threshold))?;
        let forward = choose(&keep, &ops::sign(value)?, &Value::Constant(0.0))?;
        ops::straight_through(&ops::stop_gradient(&forward)?, value)
    }

    fn report(&self, _before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(Entries::new()
            .with("threshold", self.threshold)
            .with("density", density(&after.evaluate()?))
            .finish())
    }
}

/// Trained ternary quantizer: entries above `threshold * max|x|` become the
/// trainable positive scale, entries below its negation the trainable
/// negative scale, the rest zero.
#[derive(Debug, Clone)]
pub struct DGTrainableQuantizer {
    threshold: f64,
    positive: Option<StateVariable>,
    negative: Option<StateVariable>,
}

impl DGTrainableQuantizer {
    pub fn new(threshold: f64) -> OverrideResult<Self> {
        if !(0.0..1.0).contains(&threshold) {
            return Err(OverrideError::config(format!(
                "DGTrainableQuantizer: threshold must be within [0, 1), got {threshold}"
            )));
        }
        Ok(Self {
            threshold,
            positive: None,
            negative: None,
        })
    }

    fn scales(&self) -> OverrideResult<(&StateVariable, &StateVariable)> {
        match (&self.positive, &self.negative) {
            (Some(p), Some(n)) => Ok((p, n)),
            _ => Err(OverrideError::NotApplied {
                name: self.kind().to_string(),
            }),
        }
    }
}

/// Mean magnitude of the entries selected by `keep`, 1 when none are.
fn selected_mean(values: &ArrayD<f32>, keep: impl Fn(f32) -> bool) -> f32 {
    let (total, count) = values
        .iter()
        .filter(|&&v| keep(v))
        .fold((0.0f64, 0usize), |(t, c), &v| (t + (v as f64).abs(), c + 1));
    if count == 0 {
        1.0
    } else {
        (total / count as f64) as f32
    }
}

impl Transform for DGTrainableQuantizer {
    fn kind(&self) -> &'static str {
        "DGTrainableQuantizer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let values = before.evaluate()?;
        let cut = (self.threshold * max_abs(&values)) as f32;
        let positive = selected_mean(&values, |v| v > cut);
        let negative = selected_mean(&values, |v| v < -cut);
        self.positive = Some(scope.state(
            "positive_scale",
            ArrayD::from_elem(IxDyn(&[]), positive),
            true,
        ));
        self.negative = Some(scope.state(
            "negative_scale",
            ArrayD::from_elem(IxDyn(&[]), negative),
            true,
        ));
        Ok(())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let (positive, negative) = self.scales()?;
        let cut = ops::mul(&detached_max_abs(value)?, &Value::Constant(self.threshold))?;
        let above = ops::stop_gradient(&ops::cast(&ops::greater(value, &cut)?, DType::Float)?)?;
        let below = ops::stop_gradient(&ops::cast(
            &ops::less(value, &ops::neg(&cut)?)?,
            DType::Float,
        )?)?;
        let forward = ops::sub(
            &ops::mul(&positive.value(), &above)?,
            &ops::mul(&negative.value(), &below)?,
        )?;
        let identity = ops::sub(value, &ops::stop_gradient(value)?)?;
        ops::add(&forward, &identity)
    }

    fn report(&self, _before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let (positive, negative) = self.scales()?;
        let read = |state: &StateVariable| -> OverrideResult<f64> {
            Ok(state.read()?.iter().next().copied().unwrap_or_default() as f64)
        };
        Ok(Entries::new()
            .with("threshold", self.threshold)
            .with("positive_scale", read(positive)?)
            .with("negative_scale", read(negative)?)
            .with("density", density(&after.evaluate()?))
            .finish())
    }

    fn reset(&mut self) {
        self.positive = None;
        self.negative = None;
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.positive.iter().chain(self.negative.iter()))
    }
}
