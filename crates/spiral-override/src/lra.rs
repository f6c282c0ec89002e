// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Truncated-SVD low-rank approximation.
//!
//! The parameter is viewed as a `[prod(shape[..-1]), shape[-1]]` matrix and
//! replaced by the product of two factors `U·Σ` (`[m, rank]`) and `Vᵀ`
//! (`[rank, n]`). In the symbolic domain both factors are trainable graph
//! variables, so the network keeps training the factorised form.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayD};
use tracing::debug;

use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::ops;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::{mse, Entries};
use crate::value::Value;

/// Factors of a rank-`rank` approximation.
#[derive(Debug, Clone)]
pub struct Factors {
    pub left: Array2<f32>,
    pub right: Array2<f32>,
}

/// Splits `values` into `[m, n]` with `n` the last axis.
fn matrix_dims(shape: &[usize]) -> OverrideResult<(usize, usize)> {
    match shape.split_last() {
        Some((&n, rest)) if !rest.is_empty() => Ok((rest.iter().product(), n)),
        _ => Err(OverrideError::invalid(
            "LowRankApproximation",
            format!("expected a tensor of rank 2 or more, got shape {shape:?}"),
        )),
    }
}

/// Truncated SVD of `values` viewed as a matrix.
pub fn factorize(values: &ArrayD<f32>, rank: usize) -> OverrideResult<Factors> {
    let (m, n) = matrix_dims(values.shape())?;
    if rank == 0 || rank > m.min(n) {
        return Err(OverrideError::config(format!(
            "LowRankApproximation: rank must be within 1..={}, got {rank}",
            m.min(n)
        )));
    }
    let data: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let matrix = DMatrix::from_row_slice(m, n, &data);
    let svd = matrix.svd(true, true);
    let failed = || OverrideError::invalid("LowRankApproximation", "SVD did not converge");
    let u = svd.u.as_ref().ok_or_else(failed)?;
    let v_t = svd.v_t.as_ref().ok_or_else(failed)?;
    let sigma = &svd.singular_values;
    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&a, &b| sigma[b].partial_cmp(&sigma[a]).unwrap_or(Ordering::Equal));
    order.truncate(rank);
    let left = Array2::from_shape_fn((m, rank), |(i, k)| {
        (u[(i, order[k])] * sigma[order[k]]) as f32
    });
    let right = Array2::from_shape_fn((rank, n), |(k, j)| v_t[(order[k], j)] as f32);
    Ok(Factors { left, right })
}

#[derive(Debug, Clone)]
pub struct LowRankApproximation {
    rank: usize,
    shape: Vec<usize>,
    left: Option<StateVariable>,
    right: Option<StateVariable>,
    /// Immediate value the current factors were computed from.
    source: Option<ArrayD<f32>>,
}

impl LowRankApproximation {
    pub fn new(rank: usize) -> OverrideResult<Self> {
        if rank == 0 {
            return Err(OverrideError::config(
                "LowRankApproximation: rank must be at least 1",
            ));
        }
        Ok(Self {
            rank,
            shape: Vec::new(),
            left: None,
            right: None,
            source: None,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn install(&mut self, scope: &Scope, values: &ArrayD<f32>) -> OverrideResult<()> {
        let factors = factorize(values, self.rank)?;
        self.shape = values.shape().to_vec();
        self.left = Some(scope.state("left", factors.left.into_dyn(), true));
        self.right = Some(scope.state("right", factors.right.into_dyn(), true));
        debug!(
            scope = scope.name(),
            rank = self.rank,
            shape = ?self.shape,
            "low-rank factors created"
        );
        Ok(())
    }

    fn factors(&self) -> OverrideResult<(&StateVariable, &StateVariable)> {
        match (&self.left, &self.right) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(OverrideError::NotApplied {
                name: "LowRankApproximation".to_string(),
            }),
        }
    }
}

impl Transform for LowRankApproximation {
    fn kind(&self) -> &'static str {
        "LowRankApproximation"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        if before.is_symbolic() {
            self.install(scope, &before.evaluate()?)?;
        }
        Ok(())
    }

    /// Immediate values are refactorised when they change; symbolic ones
    /// read the trained factors.
    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value> {
        if !value.is_symbolic() {
            let values = value.evaluate()?;
            if self.source.as_ref() != Some(&values) {
                self.install(scope, &values)?;
                self.source = Some(values);
            }
        }
        let (left, right) = self.factors()?;
        let product = ops::matmul(&left.value(), &right.value())?;
        ops::reshape(&product, &self.shape)
    }

    fn report(&self, before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let (m, n) = matrix_dims(&self.shape)?;
        let stored = (m * self.rank + self.rank * n) as f64;
        Ok(Entries::new()
            .with("rank", self.rank as f64)
            .with("reconstruction_error", mse(&before.evaluate()?, &after.evaluate()?))
            .with("parameter_ratio", stored / (m * n) as f64)
            .finish())
    }

    fn reset(&mut self) {
        self.shape.clear();
        self.left = None;
        self.right = None;
        self.source = None;
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.left.iter().chain(self.right.iter()))
    }
}
