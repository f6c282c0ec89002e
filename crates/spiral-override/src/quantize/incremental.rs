// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;
use std::str::FromStr;

use ndarray::{Array1, ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::choose;
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::Entries;
use crate::value::Value;

/// Which entries are frozen first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    #[default]
    Largest,
    Smallest,
}

impl FromStr for SelectionPolicy {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "largest" => Ok(SelectionPolicy::Largest),
            "smallest" => Ok(SelectionPolicy::Smallest),
            other => Err(OverrideError::config(format!(
                "IncrementalQuantizer: unknown policy {other:?} (expected \"largest\" or \"smallest\")"
            ))),
        }
    }
}

/// Freezes a growing share of entries at their quantized value while the rest
/// stay full precision. Each `update` raises the frozen share by `interval`.
#[derive(Clone)]
pub struct IncrementalQuantizer {
    quantizer: Box<dyn Transform>,
    interval: f64,
    policy: SelectionPolicy,
    count_zero: bool,
    updates: usize,
    mask: Option<StateVariable>,
}

impl std::fmt::Debug for IncrementalQuantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalQuantizer")
            .field("quantizer", &self.quantizer.kind())
            .field("interval", &self.interval)
            .field("policy", &self.policy)
            .field("updates", &self.updates)
            .finish()
    }
}

impl IncrementalQuantizer {
    pub fn new(
        quantizer: Box<dyn Transform>,
        interval: f64,
        policy: SelectionPolicy,
        count_zero: bool,
    ) -> OverrideResult<Self> {
        if !(interval > 0.0 && interval <= 1.0) {
            return Err(OverrideError::config(format!(
                "IncrementalQuantizer: interval must be within (0, 1], got {interval}"
            )));
        }
        Ok(Self {
            quantizer,
            interval,
            policy,
            count_zero,
            updates: 0,
            mask: None,
        })
    }

    /// Frozen share targeted after `updates` calls to `update`.
    pub fn target_fraction(&self, updates: usize) -> f64 {
        let full = (1.0 / self.interval - 1e-9).ceil() as usize;
        if updates >= full {
            1.0
        } else {
            (updates as f64 * self.interval).min(1.0)
        }
    }

    fn mask_state(&self) -> OverrideResult<&StateVariable> {
        self.mask.as_ref().ok_or_else(|| OverrideError::NotApplied {
            name: "IncrementalQuantizer".to_string(),
        })
    }

    fn in_population(&self, v: f32) -> bool {
        self.count_zero || v != 0.0
    }

    /// Share of the population currently frozen.
    pub fn frozen_fraction(&self, values: &ArrayD<f32>) -> OverrideResult<f64> {
        let mask = self.mask_state()?.read()?;
        if mask.shape() != values.shape() {
            return Err(OverrideError::shape(self.kind(), mask.shape(), values.shape()));
        }
        let (mut frozen, mut population) = (0usize, 0usize);
        Zip::from(values).and(&mask).for_each(|&v, &m| {
            if self.in_population(v) {
                population += 1;
                if m != 0.0 {
                    frozen += 1;
                }
            }
        });
        Ok(if population == 0 {
            1.0
        } else {
            frozen as f64 / population as f64
        })
    }

    /// Mask freezing `fraction` of the population, unioned with `previous`.
    fn grow(
        &self,
        values: &ArrayD<f32>,
        previous: &ArrayD<f32>,
        fraction: f64,
    ) -> OverrideResult<ArrayD<f32>> {
        if previous.shape() != values.shape() {
            return Err(OverrideError::shape(self.kind(), previous.shape(), values.shape()));
        }
        let policy = self.policy;
        // Smallest-first selection ranks negated magnitudes.
        let ranked: Array1<f32> = values
            .iter()
            .filter(|&&v| self.in_population(v))
            .map(|v| match policy {
                SelectionPolicy::Largest => v.abs(),
                SelectionPolicy::Smallest => -v.abs(),
            })
            .collect();
        let target = ((fraction * ranked.len() as f64).ceil() as usize).min(ranked.len());
        if target == 0 {
            return Ok(previous.clone());
        }
        let kth = ops::top_k(&Value::Array(ranked.into_dyn()), target)?.to_scalar()? as f32;
        let cutoff = match policy {
            SelectionPolicy::Largest => kth,
            SelectionPolicy::Smallest => -kth,
        };
        Ok(Zip::from(values).and(previous).map_collect(|&v, &m| {
            let chosen = self.in_population(v)
                && match policy {
                    SelectionPolicy::Largest => v.abs() >= cutoff,
                    SelectionPolicy::Smallest => v.abs() <= cutoff,
                };
            if chosen || m != 0.0 {
                1.0
            } else {
                0.0
            }
        }))
    }
}

impl Transform for IncrementalQuantizer {
    fn kind(&self) -> &'static str {
        "IncrementalQuantizer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        self.updates = 0;
        self.mask = Some(scope.state(
            "mask",
            ArrayD::zeros(IxDyn(&before.shape())),
            false,
        ));
        self.quantizer.build(&scope.child("quantizer"), before)
    }

    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let quantized = self
            .quantizer
            .transform(&scope.child("quantizer"), value)?;
        let frozen = ops::stop_gradient(&quantized)?;
        let mask = self.mask_state()?.value();
        choose(&mask, &frozen, value)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let values = before.evaluate()?;
        let previous = self.mask_state()?.read()?;
        let updates = self.updates + 1;
        let fraction = self.target_fraction(updates);
        let next = self.grow(&values, &previous, fraction)?;
        self.quantizer.update(&scope.child("quantizer"), before)?;
        if let Some(mask) = self.mask.as_mut() {
            mask.write(next)?;
        }
        self.updates = updates;
        info!(
            scope = scope.name(),
            updates,
            target = fraction,
            "incremental quantization advanced"
        );
        Ok(())
    }

    fn report(&self, before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let mut entries = Entries::new()
            .with("interval", self.interval)
            .with("updates", self.updates as f64)
            .with("quantized_fraction", self.frozen_fraction(&before.evaluate()?)?)
            .finish();
        for (key, value) in self.quantizer.report(before, after)? {
            entries.insert(format!("quantizer/{key}"), value);
        }
        Ok(entries)
    }

    fn reset(&mut self) {
        self.updates = 0;
        self.mask = None;
        self.quantizer.reset();
    }

    fn variables(&self) -> Vec<Tensor> {
        let mut tensors = tensors_of(self.mask.iter());
        tensors.extend(self.quantizer.variables());
        tensors
    }
}
