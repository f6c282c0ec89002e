// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};
use tracing::info;

use super::{check_non_negative, keep_at_least_one, mask_density, mask_of, mean_std_threshold};
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::Entries;
use crate::value::Value;

/// Magnitude pruning with threshold `mean(|x|) + multiplier * std(|x|)`.
/// Every `update` raises the multiplier by `growth`; pruned entries never
/// come back.
#[derive(Debug, Clone)]
pub struct MeanStdPruner {
    multiplier: f64,
    growth: f64,
    current: f64,
    mask: Option<StateVariable>,
}

impl MeanStdPruner {
    pub fn new(multiplier: f64, growth: f64) -> OverrideResult<Self> {
        check_non_negative("MeanStdPruner", "growth", growth)?;
        if !multiplier.is_finite() {
            return Err(OverrideError::config(format!(
                "MeanStdPruner: multiplier must be finite, got {multiplier}"
            )));
        }
        Ok(Self {
            multiplier,
            growth,
            current: multiplier,
            mask: None,
        })
    }

    pub fn multiplier(&self) -> f64 {
        self.current
    }

    fn compute(values: &ArrayD<f32>, multiplier: f64) -> OverrideResult<ArrayD<f32>> {
        let threshold = mean_std_threshold(values, multiplier)?;
        let mask = values.mapv(|v| if (v as f64).abs() >= threshold { 1.0 } else { 0.0 });
        Ok(keep_at_least_one(mask, values))
    }
}

impl Transform for MeanStdPruner {
    fn kind(&self) -> &'static str {
        "MeanStdPruner"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        self.current = self.multiplier;
        let mask = Self::compute(&before.evaluate()?, self.current)?;
        self.mask = Some(scope.state("mask", mask, false));
        Ok(())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let mask = mask_of(self.kind(), &self.mask)?.value();
        ops::mul(value, &mask)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let values = before.evaluate()?;
        let previous = mask_of(self.kind(), &self.mask)?.read()?;
        let multiplier = self.current + self.growth;
        let fresh = Self::compute(&values, multiplier)?;
        if fresh.shape() != previous.shape() {
            return Err(OverrideError::shape(self.kind(), previous.shape(), fresh.shape()));
        }
        let merged = Zip::from(&fresh)
            .and(&previous)
            .map_collect(|&a, &b| if a != 0.0 && b != 0.0 { 1.0 } else { 0.0 });
        let merged = keep_at_least_one(merged, &values);
        let density = mask_density(&merged);
        if let Some(mask) = self.mask.as_mut() {
            mask.write(merged)?;
        }
        self.current = multiplier;
        info!(scope = scope.name(), multiplier, density, "mean/std mask tightened");
        Ok(())
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let mask = mask_of(self.kind(), &self.mask)?.read()?;
        Ok(Entries::new()
            .with("multiplier", self.current)
            .with("density", mask_density(&mask))
            .finish())
    }

    fn reset(&mut self) {
        self.current = self.multiplier;
        self.mask = None;
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.mask.iter())
    }
}

/// Dynamic network surgery: entries whose magnitude falls below
/// `off_factor * threshold` are pruned, entries rising above
/// `on_factor * threshold` are spliced back. The forward pass is masked but
/// every weight keeps receiving gradients, so pruned entries can recover.
#[derive(Debug, Clone)]
pub struct DynamicNetworkSurgeryPruner {
    multiplier: f64,
    growth: f64,
    on_factor: f64,
    off_factor: f64,
    current: f64,
    mask: Option<StateVariable>,
}

impl DynamicNetworkSurgeryPruner {
    pub fn new(multiplier: f64, growth: f64) -> OverrideResult<Self> {
        Self::with_factors(multiplier, growth, 1.1, 0.9)
    }

    pub fn with_factors(
        multiplier: f64,
        growth: f64,
        on_factor: f64,
        off_factor: f64,
    ) -> OverrideResult<Self> {
        let kind = "DynamicNetworkSurgeryPruner";
        check_non_negative(kind, "growth", growth)?;
        check_non_negative(kind, "off_factor", off_factor)?;
        if !multiplier.is_finite() {
            return Err(OverrideError::config(format!(
                "{kind}: multiplier must be finite, got {multiplier}"
            )));
        }
        if !(on_factor.is_finite() && on_factor >= off_factor) {
            return Err(OverrideError::config(format!(
                "{kind}: on_factor ({on_factor}) must not be below off_factor ({off_factor})"
            )));
        }
        Ok(Self {
            multiplier,
            growth,
            on_factor,
            off_factor,
            current: multiplier,
            mask: None,
        })
    }
}

impl Transform for DynamicNetworkSurgeryPruner {
    fn kind(&self) -> &'static str {
        "DynamicNetworkSurgeryPruner"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        self.current = self.multiplier;
        let dense = ArrayD::ones(before.shape());
        self.mask = Some(scope.state("mask", dense, false));
        Ok(())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let mask = mask_of(self.kind(), &self.mask)?.value();
        let masked = ops::mul(value, &mask)?;
        ops::straight_through(&ops::stop_gradient(&masked)?, value)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let values = before.evaluate()?;
        let previous = mask_of(self.kind(), &self.mask)?.read()?;
        if values.shape() != previous.shape() {
            return Err(OverrideError::shape(self.kind(), previous.shape(), values.shape()));
        }
        let threshold = mean_std_threshold(&values, self.current)?;
        let (on, off) = (self.on_factor * threshold, self.off_factor * threshold);
        let next = Zip::from(&values).and(&previous).map_collect(|&v, &m| {
            let magnitude = (v as f64).abs();
            if magnitude > on {
                1.0
            } else if magnitude < off {
                0.0
            } else {
                m
            }
        });
        let next = keep_at_least_one(next, &values);
        let density = mask_density(&next);
        if let Some(mask) = self.mask.as_mut() {
            mask.write(next)?;
        }
        self.current += self.growth;
        info!(scope = scope.name(), threshold, density, "surgery mask updated");
        Ok(())
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let mask = mask_of(self.kind(), &self.mask)?.read()?;
        Ok(Entries::new()
            .with("multiplier", self.current)
            .with("on_factor", self.on_factor)
            .with("off_factor", self.off_factor)
            .with("density", mask_density(&mask))
            .finish())
    }

    fn reset(&mut self) {
        self.current = self.multiplier;
        self.mask = None;
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.mask.iter())
    }
}
