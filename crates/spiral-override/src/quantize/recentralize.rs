// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::{arr1, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::choose;
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::value::Value;

/// How the two centroids evolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CentroidMode {
    /// Refreshed from the parameter statistics on every `update`.
    #[default]
    Running,
    /// Graph variables trained with the network.
    Trainable,
}

/// Quantizes the distance of each entry to the centroid of its sign cluster
/// and adds the centroid back afterwards.
#[derive(Clone)]
pub struct Recentralizer {
    quantizer: Box<dyn Transform>,
    mean_quantizer: Option<Box<dyn Transform>>,
    mode: CentroidMode,
    centroids: Option<StateVariable>,
    centred: Option<Value>,
}

impl std::fmt::Debug for Recentralizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recentralizer")
            .field("quantizer", &self.quantizer.kind())
            .field("mean_quantizer", &self.mean_quantizer.as_ref().map(|q| q.kind()))
            .field("mode", &self.mode)
            .finish()
    }
}

/// `[negative mean, positive mean]` of the two sign clusters; zeros belong to
/// the negative cluster.
fn cluster_means(values: &ArrayD<f32>) -> ArrayD<f32> {
    let mut sums = [0.0f64; 2];
    let mut counts = [0usize; 2];
    for &v in values {
        let cluster = usize::from(v > 0.0);
        sums[cluster] += v as f64;
        counts[cluster] += 1;
    }
    let mean = |i: usize| {
        if counts[i] == 0 {
            0.0
        } else {
            (sums[i] / counts[i] as f64) as f32
        }
    };
    arr1(&[mean(0), mean(1)]).into_dyn()
}

impl Recentralizer {
    pub fn new(
        quantizer: Box<dyn Transform>,
        mean_quantizer: Option<Box<dyn Transform>>,
        mode: CentroidMode,
    ) -> Self {
        Self {
            quantizer,
            mean_quantizer,
            mode,
            centroids: None,
            centred: None,
        }
    }

    fn centroid_state(&self) -> OverrideResult<&StateVariable> {
        self.centroids.as_ref().ok_or_else(|| OverrideError::NotApplied {
            name: "Recentralizer".to_string(),
        })
    }

    /// Per-entry centroid and the centred value.
    fn centre(&mut self, scope: &Scope, value: &Value) -> OverrideResult<(Value, Value)> {
        let centroids = self.centroid_state()?.value();
        let centroids = match self.mean_quantizer.as_mut() {
            Some(q) => q.transform(&scope.child("mean_quantizer"), &centroids)?,
            None => centroids,
        };
        let pick = |one_hot: [f32; 2]| -> OverrideResult<Value> {
            let selector = Value::Array(arr1(&one_hot).into_dyn());
            ops::sum(&ops::mul(&centroids, &selector)?, None, false)
        };
        let negative = pick([1.0, 0.0])?;
        let positive = pick([0.0, 1.0])?;
        let is_positive = ops::greater(value, &Value::Constant(0.0))?;
        let centre = choose(&is_positive, &positive, &negative)?;
        let centred = ops::sub(value, &centre)?;
        Ok((centre, centred))
    }
}

impl Transform for Recentralizer {
    fn kind(&self) -> &'static str {
        "Recentralizer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let means = cluster_means(&before.evaluate()?);
        let trainable = self.mode == CentroidMode::Trainable;
        let centroids = scope.state("centroids", means, trainable);
        if let Some(q) = self.mean_quantizer.as_mut() {
            q.build(&scope.child("mean_quantizer"), &centroids.value())?;
        }
        self.centroids = Some(centroids);
        let (_, centred) = self.centre(scope, before)?;
        self.quantizer.build(&scope.child("quantizer"), &centred)?;
        Ok(())
    }

    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let (centre, centred) = self.centre(scope, value)?;
        let quantized = self
            .quantizer
            .transform(&scope.child("quantizer"), &centred)?;
        self.centred = Some(centred);
        ops::add(&quantized, &centre)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        let refreshed = match self.mode {
            CentroidMode::Running => Some(cluster_means(&before.evaluate()?)),
            CentroidMode::Trainable => None,
        };
        if let Some(centred) = self.centred.clone() {
            self.quantizer.update(&scope.child("quantizer"), &centred)?;
        }
        let centroid_value = self.centroid_state()?.value();
        if let Some(q) = self.mean_quantizer.as_mut() {
            q.update(&scope.child("mean_quantizer"), &centroid_value)?;
        }
        if let (Some(means), Some(state)) = (refreshed, self.centroids.as_mut()) {
            debug!(scope = scope.name(), centroids = ?means.as_slice(), "centroids refreshed");
            state.write(means)?;
        }
        Ok(())
    }

    fn report(&self, _before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let means = self.centroid_state()?.read()?;
        let mut entries = BTreeMap::new();
        let mut values = means.iter().map(|&v| v as f64);
        entries.insert(
            "negative_centroid".to_string(),
            values.next().unwrap_or_default(),
        );
        entries.insert(
            "positive_centroid".to_string(),
            values.next().unwrap_or_default(),
        );
        if let Some(centred) = &self.centred {
            for (key, value) in self.quantizer.report(centred, after)? {
                entries.insert(format!("quantizer/{key}"), value);
            }
        }
        Ok(entries)
    }

    fn reset(&mut self) {
        self.centroids = None;
        self.centred = None;
        self.quantizer.reset();
        if let Some(q) = self.mean_quantizer.as_mut() {
            q.reset();
        }
    }

    fn variables(&self) -> Vec<Tensor> {
        let mut tensors = tensors_of(self.centroids.iter());
        tensors.extend(self.quantizer.variables());
        if let Some(q) = &self.mean_quantizer {
            tensors.extend(q.variables());
        }
        tensors
    }
}
