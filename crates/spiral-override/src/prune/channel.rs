// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Channel-level pruners. The mask has one entry per channel and is
//! broadcast across the remaining axes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{check_density, check_non_negative, mask_density, mask_of, top_channels};
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::kernels::{channel_shape, resolve_axis};
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::Entries;
use crate::value::Value;

/// Shared density schedule and mask bookkeeping.
#[derive(Debug, Clone)]
struct ChannelMask {
    kind: &'static str,
    density: f64,
    step: f64,
    axis: isize,
    current: f64,
    channel_axis: usize,
    mask: Option<StateVariable>,
}

impl ChannelMask {
    fn new(kind: &'static str, density: f64, axis: isize, step: f64) -> OverrideResult<Self> {
        check_density(kind, density)?;
        check_non_negative(kind, "step", step)?;
        Ok(Self {
            kind,
            density,
            step,
            axis,
            current: density,
            channel_axis: 0,
            mask: None,
        })
    }

    fn resolve(&mut self, shape: &[usize]) -> OverrideResult<usize> {
        if shape.is_empty() {
            return Err(OverrideError::invalid(
                self.kind,
                "channel pruning needs a tensor of rank 1 or more",
            ));
        }
        self.channel_axis = resolve_axis(self.kind, shape.len(), self.axis)?;
        Ok(shape[self.channel_axis])
    }

    fn mask_array(&self, scores: &[f64], rank: usize) -> OverrideResult<ArrayD<f32>> {
        let kept: Array1<f32> = top_channels(scores, self.current)?
            .into_iter()
            .map(|keep| if keep { 1.0 } else { 0.0 })
            .collect();
        let shape = channel_shape(rank, self.channel_axis, scores.len());
        kept.into_shape(IxDyn(&shape))
            .map_err(|_| OverrideError::shape(self.kind, &[scores.len()], &shape))
    }

    fn build(&mut self, scope: &Scope, scores: &[f64], rank: usize) -> OverrideResult<()> {
        self.current = self.density;
        let mask = self.mask_array(scores, rank)?;
        self.mask = Some(scope.state("mask", mask, false));
        Ok(())
    }

    fn apply(&self, value: &Value) -> OverrideResult<Value> {
        let mask = mask_of(self.kind, &self.mask)?.value();
        ops::mul(value, &mask)
    }

    fn advance(&mut self, scope: &Scope, scores: &[f64], rank: usize) -> OverrideResult<()> {
        let previous = self.current;
        self.current = (self.current - self.step).max(f64::MIN_POSITIVE);
        let next = match self.mask_array(scores, rank) {
            Ok(next) => next,
            Err(err) => {
                self.current = previous;
                return Err(err);
            }
        };
        let kept = mask_density(&next);
        if let Some(mask) = self.mask.as_mut() {
            if let Err(err) = mask.write(next) {
                self.current = previous;
                return Err(err);
            }
        }
        info!(
            scope = scope.name(),
            target = self.current,
            kept,
            "channel mask updated"
        );
        Ok(())
    }

    fn report(&self) -> OverrideResult<BTreeMap<String, f64>> {
        let mask = mask_of(self.kind, &self.mask)?.read()?;
        Ok(Entries::new()
            .with("target_density", self.current)
            .with("channels", mask.len() as f64)
            .with("density", mask_density(&mask))
            .finish())
    }

    fn reset(&mut self) {
        self.current = self.density;
        self.mask = None;
    }
}

/// Sum of `f(x)` over every entry of each channel along `axis`.
fn per_channel(values: &ArrayD<f32>, axis: usize, f: impl Fn(f64) -> f64) -> Vec<f64> {
    let mut totals = vec![0.0f64; values.shape()[axis]];
    for (position, &v) in values.indexed_iter() {
        totals[position[axis]] += f(v as f64);
    }
    totals
}

/// Network slimming: channels are ranked by `|γ|` of a per-channel scaling
/// tensor (typically a normalisation scale), and the top `density` fraction
/// is kept. A 1-D parameter without a scaling tensor is ranked by itself.
#[derive(Debug, Clone)]
pub struct NetworkSlimmer {
    channels: ChannelMask,
    scaling: Option<Value>,
}

impl NetworkSlimmer {
    pub fn new(density: f64, axis: Option<isize>, step: f64) -> OverrideResult<Self> {
        Ok(Self {
            channels: ChannelMask::new("NetworkSlimmer", density, axis.unwrap_or(-1), step)?,
            scaling: None,
        })
    }

    /// Ranks channels by this scaling tensor instead of the parameter.
    pub fn with_scaling(mut self, scaling: Value) -> Self {
        self.scaling = Some(scaling);
        self
    }

    fn scores(&self, before: &Value, channels: usize) -> OverrideResult<Vec<f64>> {
        let gamma = match &self.scaling {
            Some(scaling) => scaling.evaluate()?,
            None if before.shape().len() == 1 => before.evaluate()?,
            None => {
                return Err(OverrideError::invalid(
                    "NetworkSlimmer",
                    "a scaling tensor is required for parameters of rank 2 or more",
                ))
            }
        };
        if gamma.len() != channels {
            return Err(OverrideError::shape("NetworkSlimmer", gamma.shape(), &[channels]));
        }
        Ok(gamma.iter().map(|&g| (g as f64).abs()).collect())
    }
}

impl Transform for NetworkSlimmer {
    fn kind(&self) -> &'static str {
        "NetworkSlimmer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let shape = before.shape();
        let channels = self.channels.resolve(&shape)?;
        let scores = self.scores(before, channels)?;
        self.channels.build(scope, &scores, shape.len())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        self.channels.apply(value)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let shape = before.shape();
        let channels = shape
            .get(self.channels.channel_axis)
            .copied()
            .unwrap_or_default();
        let scores = self.scores(before, channels)?;
        self.channels.advance(scope, &scores, shape.len())
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        self.channels.report()
    }

    fn reset(&mut self) {
        self.channels.reset();
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.channels.mask.iter())
    }
}

/// Filter norm used to rank channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterNorm {
    L1,
    #[default]
    L2,
}

impl FromStr for FilterNorm {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1" => Ok(FilterNorm::L1),
            "l2" => Ok(FilterNorm::L2),
            other => Err(OverrideError::config(format!(
                "FilterPruner: unknown norm {other:?} (expected \"l1\" or \"l2\")"
            ))),
        }
    }
}

impl fmt::Display for FilterNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterNorm::L1 => "l1",
            FilterNorm::L2 => "l2",
        })
    }
}

/// Filter pruning: each output filter (a slice along `axis`) is scored by
/// its L1 or L2 norm and the top `density` fraction is kept.
#[derive(Debug, Clone)]
pub struct FilterPruner {
    channels: ChannelMask,
    norm: FilterNorm,
}

impl FilterPruner {
    pub fn new(
        density: f64,
        norm: FilterNorm,
        axis: Option<isize>,
        step: f64,
    ) -> OverrideResult<Self> {
        Ok(Self {
            channels: ChannelMask::new("FilterPruner", density, axis.unwrap_or(-1), step)?,
            norm,
        })
    }

    fn scores(&self, values: &ArrayD<f32>) -> Vec<f64> {
        let axis = self.channels.channel_axis;
        match self.norm {
            FilterNorm::L1 => per_channel(values, axis, f64::abs),
            FilterNorm::L2 => per_channel(values, axis, |v| v * v)
                .into_iter()
                .map(f64::sqrt)
                .collect(),
        }
    }
}

impl Transform for FilterPruner {
    fn kind(&self) -> &'static str {
        "FilterPruner"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let shape = before.shape();
        self.channels.resolve(&shape)?;
        let scores = self.scores(&before.evaluate()?);
        self.channels.build(scope, &scores, shape.len())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        self.channels.apply(value)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let values = before.evaluate()?;
        if values.ndim() <= self.channels.channel_axis {
            return Err(OverrideError::invalid(
                "FilterPruner",
                "parameter rank changed since build",
            ));
        }
        let scores = self.scores(&values);
        self.channels.advance(scope, &scores, values.ndim())
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let mut entries = self.channels.report()?;
        let order = match self.norm {
            FilterNorm::L1 => 1.0,
            FilterNorm::L2 => 2.0,
        };
        entries.insert("norm".to_string(), order);
        Ok(entries)
    }

    fn reset(&mut self) {
        self.channels.reset();
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.channels.mask.iter())
    }
}
