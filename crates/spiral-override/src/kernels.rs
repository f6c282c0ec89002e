// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Eager numeric kernels shared by the immediate-array domain and the forward
//! passes of graph primitives. Scalars go through the same `apply` functions,
//! so all three domains agree on rounding, saturation and comparison results.

use std::cmp::Ordering;

use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};

use crate::error::{OverrideError, OverrideResult};

/// Elementwise single-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Ln,
    Log2,
    Exp2,
    Floor,
    Ceil,
    Round,
    Sign,
    Square,
    LogicalNot,
}

impl UnaryOp {
    pub fn label(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Ln => "log",
            UnaryOp::Log2 => "log2",
            UnaryOp::Exp2 => "exp2",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Round => "round",
            UnaryOp::Sign => "sign",
            UnaryOp::Square => "square",
            UnaryOp::LogicalNot => "logical_not",
        }
    }

    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Ln => x.ln(),
            UnaryOp::Log2 => x.log2(),
            UnaryOp::Exp2 => x.exp2(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Round => x.round_ties_even(),
            UnaryOp::Sign => sign(x),
            UnaryOp::Square => x * x,
            UnaryOp::LogicalNot => truth(x == 0.0),
        }
    }
}

/// Elementwise two-operand operations with numpy broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Minimum,
    Maximum,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn label(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Maximum => "maximum",
            BinaryOp::LogicalAnd => "logical_and",
            BinaryOp::LogicalOr => "logical_or",
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Minimum => a.min(b),
            BinaryOp::Maximum => a.max(b),
            BinaryOp::LogicalAnd => truth(a != 0.0 && b != 0.0),
            BinaryOp::LogicalOr => truth(a != 0.0 || b != 0.0),
        }
    }
}

/// Elementwise comparisons producing 0/1 masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

impl CompareOp {
    pub fn label(self) -> &'static str {
        match self {
            CompareOp::Equal => "equal",
            CompareOp::NotEqual => "not_equal",
            CompareOp::Greater => "greater",
            CompareOp::GreaterEqual => "greater_equal",
            CompareOp::Less => "less",
            CompareOp::LessEqual => "less_equal",
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        truth(match self {
            CompareOp::Equal => a == b,
            CompareOp::NotEqual => a != b,
            CompareOp::Greater => a > b,
            CompareOp::GreaterEqual => a >= b,
            CompareOp::Less => a < b,
            CompareOp::LessEqual => a <= b,
        })
    }
}

/// Axis reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn label(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "reduce_max",
            ReduceOp::Min => "reduce_min",
        }
    }
}

#[inline]
pub(crate) fn truth(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

#[inline]
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub(crate) fn map(x: &ArrayD<f32>, op: UnaryOp) -> ArrayD<f32> {
    x.mapv(|v| op.apply(v as f64) as f32)
}

/// Numpy-style broadcast of two shapes (trailing dimensions aligned).
pub(crate) fn broadcast_shape(
    op: &'static str,
    left: &[usize],
    right: &[usize],
) -> OverrideResult<Vec<usize>> {
    let rank = left.len().max(right.len());
    let pad_left = rank - left.len();
    let pad_right = rank - right.len();
    let mut shape = Vec::with_capacity(rank);
    for axis in 0..rank {
        let l = if axis < pad_left { 1 } else { left[axis - pad_left] };
        let r = if axis < pad_right {
            1
        } else {
            right[axis - pad_right]
        };
        let dim = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return Err(OverrideError::shape(op, left, right)),
        };
        shape.push(dim);
    }
    Ok(shape)
}

pub(crate) fn zip2(
    op: &'static str,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f64, f64) -> f64,
) -> OverrideResult<ArrayD<f32>> {
    let shape = broadcast_shape(op, a.shape(), b.shape())?;
    let mismatch = || OverrideError::shape(op, a.shape(), b.shape());
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(&av)
        .and(&bv)
        .map_collect(|&x, &y| f(x as f64, y as f64) as f32))
}

pub(crate) fn zip3(
    op: &'static str,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    c: &ArrayD<f32>,
    f: impl Fn(f64, f64, f64) -> f64,
) -> OverrideResult<ArrayD<f32>> {
    let shape = broadcast_shape(op, a.shape(), b.shape())?;
    let shape = broadcast_shape(op, &shape, c.shape())?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| OverrideError::shape(op, a.shape(), &shape))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| OverrideError::shape(op, b.shape(), &shape))?;
    let cv = c
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| OverrideError::shape(op, c.shape(), &shape))?;
    Ok(Zip::from(&av)
        .and(&bv)
        .and(&cv)
        .map_collect(|&x, &y, &z| f(x as f64, y as f64, z as f64) as f32))
}

/// Sums a broadcast gradient back down to the operand shape.
pub(crate) fn reduce_to_shape(grad: ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    let mut grad = grad;
    while grad.ndim() > shape.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    grad
}

pub(crate) fn normalize_axes(
    op: &'static str,
    rank: usize,
    axes: Option<&[usize]>,
) -> OverrideResult<Vec<usize>> {
    let mut axes: Vec<usize> = match axes {
        Some(axes) => axes.to_vec(),
        None => (0..rank).collect(),
    };
    axes.sort_unstable();
    axes.dedup();
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= rank) {
        return Err(OverrideError::invalid(
            op,
            format!("axis {axis} out of range for rank {rank}"),
        ));
    }
    Ok(axes)
}

pub(crate) fn reduced_shape(shape: &[usize], axes: &[usize], keep_dims: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(axis, &dim)| match (axes.contains(&axis), keep_dims) {
            (false, _) => Some(dim),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

pub(crate) fn reduce(
    x: &ArrayD<f32>,
    axes: &[usize],
    keep_dims: bool,
    op: ReduceOp,
) -> ArrayD<f32> {
    let mut out = x.clone();
    let mut reduced = 1usize;
    for &axis in axes.iter().rev() {
        reduced *= x.shape()[axis];
        out = match op {
            ReduceOp::Sum | ReduceOp::Mean => out.sum_axis(Axis(axis)),
            ReduceOp::Max => out.fold_axis(Axis(axis), f32::NEG_INFINITY, |acc, &v| acc.max(v)),
            ReduceOp::Min => out.fold_axis(Axis(axis), f32::INFINITY, |acc, &v| acc.min(v)),
        };
    }
    if op == ReduceOp::Mean {
        let count = reduced as f32;
        out.mapv_inplace(|v| v / count);
    }
    if keep_dims {
        for &axis in axes {
            out = out.insert_axis(Axis(axis));
        }
    }
    out
}

/// Returns the `k`-th largest entry of the flattened tensor, i.e. the minimum
/// of the top-`k` set.
pub(crate) fn top_k_threshold(x: &ArrayD<f32>, k: usize) -> OverrideResult<f32> {
    let total = x.len();
    if k == 0 || k > total {
        return Err(OverrideError::invalid(
            "top_k",
            format!("k={k} outside 1..={total}"),
        ));
    }
    let mut values: Vec<f32> = x.iter().copied().collect();
    values.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    Ok(values[k - 1])
}

pub(crate) fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> OverrideResult<ArrayD<f32>> {
    let mismatch = || OverrideError::shape("matmul", a.shape(), b.shape());
    let a2 = a.view().into_dimensionality::<Ix2>().map_err(|_| mismatch())?;
    let b2 = b.view().into_dimensionality::<Ix2>().map_err(|_| mismatch())?;
    if a2.ncols() != b2.nrows() {
        return Err(mismatch());
    }
    Ok(a2.dot(&b2).into_dyn())
}

pub(crate) fn transpose2(x: &ArrayD<f32>) -> OverrideResult<ArrayD<f32>> {
    let x2 = x
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| OverrideError::invalid("transpose", "expected a 2-D tensor"))?;
    Ok(x2.t().to_owned().into_dyn())
}

/// Resolves a possibly negative axis against `rank`.
pub(crate) fn resolve_axis(op: &'static str, rank: usize, axis: isize) -> OverrideResult<usize> {
    let resolved = if axis < 0 { rank as isize + axis } else { axis };
    if resolved < 0 || resolved >= rank as isize {
        return Err(OverrideError::invalid(
            op,
            format!("axis {axis} out of range for rank {rank}"),
        ));
    }
    Ok(resolved as usize)
}

/// Shape that broadcasts a per-channel vector of `channels` entries along
/// `axis` of a rank-`rank` tensor.
pub(crate) fn channel_shape(rank: usize, axis: usize, channels: usize) -> Vec<usize> {
    (0..rank).map(|i| if i == axis { channels } else { 1 }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn negative_axes_count_from_the_end() {
        assert_eq!(resolve_axis("t", 4, -1).unwrap(), 3);
        assert_eq!(resolve_axis("t", 4, 0).unwrap(), 0);
        assert!(resolve_axis("t", 2, -3).is_err());
        assert_eq!(channel_shape(3, 1, 5), vec![1, 5, 1]);
    }

    #[test]
    fn broadcast_aligns_trailing_axes() {
        assert_eq!(broadcast_shape("t", &[3, 1, 4], &[5, 1]).unwrap(), vec![3, 5, 4]);
        assert_eq!(broadcast_shape("t", &[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shape("t", &[3], &[4]).is_err());
    }

    #[test]
    fn gradients_collapse_to_operand_shape() {
        let grad = ArrayD::<f32>::ones(IxDyn(&[2, 3, 4]));
        let reduced = reduce_to_shape(grad, &[1, 4]);
        assert_eq!(reduced.shape(), &[1, 4]);
        assert!(reduced.iter().all(|&v| v == 6.0));
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(UnaryOp::Round.apply(2.5), 2.0);
        assert_eq!(UnaryOp::Round.apply(3.5), 4.0);
        assert_eq!(UnaryOp::Round.apply(-0.5), -0.0);
    }

    #[test]
    fn reductions_respect_keep_dims() {
        let x = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let mean = reduce(&x, &[0], true, ReduceOp::Mean);
        assert_eq!(mean.shape(), &[1, 2]);
        assert_eq!(mean[[0, 1]], 3.0);
        let max = reduce(&x, &[0, 1], false, ReduceOp::Max);
        assert_eq!(max.ndim(), 0);
        assert_eq!(max.iter().next().copied(), Some(4.0));
    }
}
