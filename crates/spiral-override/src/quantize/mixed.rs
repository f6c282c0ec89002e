// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayD};
use tracing::info;

use super::choose;
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::kernels::{channel_shape, resolve_axis};
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::value::Value;

/// Applies one of several quantizers to each channel of a tensor. Channel
/// `c` uses quantizer `assignment[c]`.
#[derive(Clone)]
pub struct MixedQuantizer {
    quantizers: Vec<Box<dyn Transform>>,
    axis: isize,
    initial: Option<Vec<usize>>,
    reassign: bool,
    channel_axis: usize,
    assignment: Option<StateVariable>,
}

impl std::fmt::Debug for MixedQuantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.quantizers.iter().map(|q| q.kind()).collect();
        f.debug_struct("MixedQuantizer")
            .field("quantizers", &kinds)
            .field("axis", &self.axis)
            .field("reassign", &self.reassign)
            .finish()
    }
}

impl MixedQuantizer {
    /// `axis` defaults to the last axis. Without an explicit `assignment`
    /// every channel starts on the first quantizer.
    pub fn new(
        quantizers: Vec<Box<dyn Transform>>,
        axis: Option<isize>,
        assignment: Option<Vec<usize>>,
        reassign: bool,
    ) -> OverrideResult<Self> {
        if quantizers.is_empty() {
            return Err(OverrideError::config(
                "MixedQuantizer: at least one quantizer is required",
            ));
        }
        if let Some(&bad) = assignment
            .iter()
            .flatten()
            .find(|&&index| index >= quantizers.len())
        {
            return Err(OverrideError::config(format!(
                "MixedQuantizer: assignment {bad} refers to one of {} quantizers",
                quantizers.len()
            )));
        }
        Ok(Self {
            quantizers,
            axis: axis.unwrap_or(-1),
            initial: assignment,
            reassign,
            channel_axis: 0,
            assignment: None,
        })
    }

    fn assignment_state(&self) -> OverrideResult<&StateVariable> {
        self.assignment.as_ref().ok_or_else(|| OverrideError::NotApplied {
            name: "MixedQuantizer".to_string(),
        })
    }

    /// Current quantizer index of every channel.
    pub fn assignment(&self) -> OverrideResult<Vec<usize>> {
        Ok(self
            .assignment_state()?
            .read()?
            .iter()
            .map(|&index| index.max(0.0) as usize)
            .collect())
    }

    fn child(scope: &Scope, index: usize) -> Scope {
        scope.child(&format!("quantizer{index}"))
    }

    /// Sum of squared errors of every quantizer on every channel.
    fn channel_errors(&mut self, scope: &Scope, before: &Value) -> OverrideResult<Vec<Vec<f64>>> {
        let values = before.evaluate()?;
        let channels = values.shape()[self.channel_axis];
        let mut errors = Vec::with_capacity(self.quantizers.len());
        for (index, quantizer) in self.quantizers.iter_mut().enumerate() {
            let quantized = quantizer
                .transform(&Self::child(scope, index), before)?
                .evaluate()?;
            let mut per_channel = vec![0.0f64; channels];
            for ((position, &v), &q) in values.indexed_iter().zip(quantized.iter()) {
                let d = q as f64 - v as f64;
                per_channel[position[self.channel_axis]] += d * d;
            }
            errors.push(per_channel);
        }
        Ok(errors)
    }
}

impl Transform for MixedQuantizer {
    fn kind(&self) -> &'static str {
        "MixedQuantizer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let shape = before.shape();
        if shape.is_empty() {
            return Err(OverrideError::invalid(
                "MixedQuantizer",
                "channel assignment needs a tensor of rank 1 or more",
            ));
        }
        self.channel_axis = resolve_axis("MixedQuantizer", shape.len(), self.axis)?;
        let channels = shape[self.channel_axis];
        let initial: Array1<f32> = match &self.initial {
            Some(initial) if initial.len() != channels => {
                return Err(OverrideError::config(format!(
                    "MixedQuantizer: assignment has {} entries for {channels} channels",
                    initial.len()
                )));
            }
            Some(initial) => initial.iter().map(|&i| i as f32).collect(),
            None => Array1::zeros(channels),
        };
        self.assignment = Some(scope.state("assignment", initial.into_dyn(), false));
        for (index, quantizer) in self.quantizers.iter_mut().enumerate() {
            quantizer.build(&Self::child(scope, index), before)?;
        }
        Ok(())
    }

    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let rank = value.shape().len();
        let channels = self.assignment_state()?.shape().iter().product();
        let assignment = ops::reshape(
            &self.assignment_state()?.value(),
            &channel_shape(rank, self.channel_axis, channels),
        )?;
        let mut result: Option<Value> = None;
        for (index, quantizer) in self.quantizers.iter_mut().enumerate() {
            let quantized = quantizer.transform(&Self::child(scope, index), value)?;
            result = Some(match result {
                None => quantized,
                Some(previous) => {
                    let selected = ops::equal(&assignment, &Value::Constant(index as f64))?;
                    choose(&selected, &quantized, &previous)?
                }
            });
        }
        result.ok_or_else(|| OverrideError::config("MixedQuantizer: no quantizers"))
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        for (index, quantizer) in self.quantizers.iter_mut().enumerate() {
            quantizer.update(&Self::child(scope, index), before)?;
        }
        if !self.reassign {
            return Ok(());
        }
        let errors = self.channel_errors(scope, before)?;
        let channels = errors.first().map_or(0, Vec::len);
        let best: Vec<f32> = (0..channels)
            .map(|c| {
                let mut winner = 0;
                for (index, per_channel) in errors.iter().enumerate() {
                    if per_channel[c] < errors[winner][c] {
                        winner = index;
                    }
                }
                winner as f32
            })
            .collect();
        let next: ArrayD<f32> = Array1::from(best).into_dyn();
        if let Some(state) = self.assignment.as_mut() {
            state.write(next)?;
        }
        info!(scope = scope.name(), assignment = ?self.assignment()?, "channels reassigned");
        Ok(())
    }

    fn report(&self, before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let assignment = self.assignment()?;
        let mut entries = BTreeMap::new();
        for (index, quantizer) in self.quantizers.iter().enumerate() {
            let assigned = assignment.iter().filter(|&&a| a == index).count();
            entries.insert(format!("assigned/{index}"), assigned as f64);
            for (key, value) in quantizer.report(before, after)? {
                entries.insert(format!("quantizer{index}/{key}"), value);
            }
        }
        Ok(entries)
    }

    fn reset(&mut self) {
        self.assignment = None;
        for quantizer in &mut self.quantizers {
            quantizer.reset();
        }
    }

    fn variables(&self) -> Vec<Tensor> {
        let mut tensors = tensors_of(self.assignment.iter());
        for quantizer in &self.quantizers {
            tensors.extend(quantizer.variables());
        }
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrider::{Overrider, Overriding};
    use crate::quantize::{FixedPointQuantizer, Point};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn fixed(width: u32) -> Box<dyn Transform> {
        Box::new(FixedPointQuantizer::new(width, Point::Fixed(2)).unwrap())
    }

    #[test]
    fn channels_follow_their_assignment() {
        let mixed = MixedQuantizer::new(vec![fixed(4), fixed(8)], None, Some(vec![0, 1]), false)
            .unwrap();
        let mut q = Overriding::new("mixed", mixed);
        let x = Value::from(array![[0.3f32, 0.3], [-0.6, -0.6]].into_dyn());
        let y = q.apply(&x).unwrap().evaluate().unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 0.25);
        assert_abs_diff_eq!(y[[1, 0]], -0.5);
        assert_abs_diff_eq!(y[[0, 1]], 0.296875);
        assert_abs_diff_eq!(y[[1, 1]], -0.59375);
        let report = q.report().unwrap().remove(0);
        assert_eq!(report.get("assigned/0"), Some(1.0));
        assert_eq!(report.get("assigned/1"), Some(1.0));
    }

    #[test]
    fn reassignment_picks_the_lowest_error() {
        let mixed = MixedQuantizer::new(vec![fixed(4), fixed(8)], Some(0), None, true).unwrap();
        let mut q = Overriding::new("mixed", mixed);
        let x = Value::from(array![[0.3f32, 0.5], [-0.6, 0.25]].into_dyn());
        q.apply(&x).unwrap();
        q.update().unwrap();
        assert_eq!(q.transform().assignment().unwrap(), vec![1, 1]);
        let y = q.after().unwrap().evaluate().unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 0.296875);
    }

    #[test]
    fn assignment_length_must_match_channels() {
        let mixed = MixedQuantizer::new(vec![fixed(4)], None, Some(vec![0, 0, 0]), false).unwrap();
        let mut q = Overriding::new("mixed", mixed);
        let x = Value::from(array![1.0f32, 2.0].into_dyn());
        assert!(matches!(
            q.apply(&x),
            Err(OverrideError::Configuration { .. })
        ));
        assert!(MixedQuantizer::new(vec![fixed(4)], None, Some(vec![2]), false).is_err());
    }
}
