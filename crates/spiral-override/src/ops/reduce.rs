// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{ArrayD, Dimension, IxDyn};

use super::math::{cast, square, sub};
use super::require_non_constant;
use crate::error::{OverrideError, OverrideResult};
use crate::graph::primitive::{Reduce, TopK};
use crate::kernels::{self, ReduceOp};
use crate::value::{DType, Domain, Value};

fn reduction(
    op: ReduceOp,
    value: &Value,
    axes: Option<&[usize]>,
    keep_dims: bool,
) -> OverrideResult<Value> {
    require_non_constant(op.label(), &[value])?;
    Ok(match value {
        Value::Constant(_) => return Err(OverrideError::DomainMismatch { op: op.label() }),
        Value::Array(array) => {
            let axes = kernels::normalize_axes(op.label(), array.ndim(), axes)?;
            Value::Array(kernels::reduce(array, &axes, keep_dims, op))
        }
        Value::Symbolic(tensor) => {
            let primitive = Reduce {
                op,
                axes: axes.map(<[usize]>::to_vec),
                keep_dims,
            };
            Value::Symbolic(tensor.graph().apply(primitive, &[tensor])?)
        }
    })
}

/// Sum over `axes` (all axes when `None`).
pub fn sum(value: &Value, axes: Option<&[usize]>, keep_dims: bool) -> OverrideResult<Value> {
    reduction(ReduceOp::Sum, value, axes, keep_dims)
}

pub fn mean(value: &Value, axes: Option<&[usize]>, keep_dims: bool) -> OverrideResult<Value> {
    reduction(ReduceOp::Mean, value, axes, keep_dims)
}

pub fn reduce_max(value: &Value, axes: Option<&[usize]>, keep_dims: bool) -> OverrideResult<Value> {
    reduction(ReduceOp::Max, value, axes, keep_dims)
}

pub fn reduce_min(value: &Value, axes: Option<&[usize]>, keep_dims: bool) -> OverrideResult<Value> {
    reduction(ReduceOp::Min, value, axes, keep_dims)
}

/// Number of non-zero entries over `axes`.
pub fn count(value: &Value, axes: Option<&[usize]>, keep_dims: bool) -> OverrideResult<Value> {
    require_non_constant("count", &[value])?;
    sum(&cast(value, DType::Bool)?, axes, keep_dims)
}

/// The `k`-th largest entry of the flattened value: the minimum of the top-`k`
/// set. Pruners pass magnitudes to obtain a cutoff.
pub fn top_k(value: &Value, k: usize) -> OverrideResult<Value> {
    require_non_constant("top_k", &[value])?;
    Ok(match value {
        Value::Constant(_) => return Err(OverrideError::DomainMismatch { op: "top_k" }),
        Value::Array(array) => Value::Array(ArrayD::from_elem(
            IxDyn(&[]),
            kernels::top_k_threshold(array, k)?,
        )),
        Value::Symbolic(tensor) => Value::Symbolic(tensor.graph().apply(TopK(k), &[tensor])?),
    })
}

/// Mean and (biased) variance of the raw values over `axes`.
pub fn moments(
    value: &Value,
    axes: Option<&[usize]>,
    keep_dims: bool,
) -> OverrideResult<(Value, Value)> {
    if let Value::Constant(c) = value {
        return Ok((Value::Constant(*c), Value::Constant(0.0)));
    }
    let centre = mean(value, axes, true)?;
    let deviation = square(&sub(value, &centre)?)?;
    if keep_dims {
        Ok((centre, mean(&deviation, axes, true)?))
    } else {
        Ok((mean(value, axes, false)?, mean(&deviation, axes, false)?))
    }
}

/// Coordinates of the non-zero entries of an immediate array, in row-major
/// order.
pub fn nonzero(value: &Value) -> OverrideResult<Vec<Vec<usize>>> {
    match value {
        Value::Constant(_) => Err(OverrideError::DomainMismatch { op: "nonzero" }),
        Value::Symbolic(_) => Err(OverrideError::UnsupportedOperation {
            op: "nonzero",
            domain: Domain::SymbolicTensor,
        }),
        Value::Array(array) => Ok(array
            .indexed_iter()
            .filter(|(_, v)| **v != 0.0)
            .map(|(index, _)| index.slice().to_vec())
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn top_k_returns_kth_largest() {
        let x = Value::from(array![5.0f32, 1.0, 9.0, 3.0, 7.0].into_dyn());
        assert_eq!(top_k(&x, 2).unwrap().to_scalar().unwrap(), 7.0);
        assert_eq!(top_k(&x, 5).unwrap().to_scalar().unwrap(), 1.0);
        assert!(top_k(&x, 0).is_err());
        assert!(top_k(&x, 6).is_err());
    }

    #[test]
    fn moments_agree_across_domains() {
        let data = array![[1.0f32, -2.0], [3.0, 6.0]].into_dyn();
        let (m, v) = moments(&Value::from(data.clone()), None, false).unwrap();
        let graph = Graph::new();
        let t = Value::from(graph.constant(data));
        let (ms, vs) = moments(&t, None, false).unwrap();
        assert_abs_diff_eq!(m.to_scalar().unwrap(), 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(v.to_scalar().unwrap(), 8.5, epsilon = 1e-5);
        assert_abs_diff_eq!(ms.to_scalar().unwrap(), 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(vs.to_scalar().unwrap(), 8.5, epsilon = 1e-5);
    }

    #[test]
    fn nonzero_reports_coordinates_and_rejects_other_domains() {
        let x = Value::from(array![[0.0f32, 2.0], [3.0, 0.0]].into_dyn());
        assert_eq!(nonzero(&x).unwrap(), vec![vec![0, 1], vec![1, 0]]);
        assert!(matches!(
            nonzero(&Value::Constant(1.0)),
            Err(OverrideError::DomainMismatch { .. })
        ));
        let graph = Graph::new();
        let t = Value::from(graph.scalar(1.0));
        assert!(matches!(
            nonzero(&t),
            Err(OverrideError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn reductions_reject_pure_constants() {
        assert!(matches!(
            sum(&Value::Constant(2.0), None, false),
            Err(OverrideError::DomainMismatch { .. })
        ));
        let x = Value::from(array![0.0f32, 1.5, -2.0].into_dyn());
        assert_eq!(count(&x, None, false).unwrap().to_scalar().unwrap(), 2.0);
    }
}
