// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{ArrayD, IxDyn};

use super::require_non_constant;
use crate::error::{OverrideError, OverrideResult};
use crate::graph::primitive::{
    self, Binary, Cast, Clip, Compare, MatMul, Reshape, Select, StopGradient, StraightThrough,
    Unary,
};
use crate::kernels::{self, BinaryOp, CompareOp, UnaryOp};
use crate::value::{promote, DType, Domain, Operands, Value};

fn unary(value: &Value, op: UnaryOp, straight_through: bool) -> OverrideResult<Value> {
    Ok(match value {
        Value::Constant(c) => Value::Constant(op.apply(*c)),
        Value::Array(array) => Value::Array(kernels::map(array, op)),
        Value::Symbolic(tensor) => {
            let graph = tensor.graph();
            let out = if straight_through {
                graph.apply(StraightThrough(Unary(op)), &[tensor])?
            } else {
                graph.apply(Unary(op), &[tensor])?
            };
            Value::Symbolic(out)
        }
    })
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> OverrideResult<Value> {
    Ok(match promote(op.label(), &[a, b])? {
        Operands::Constant(c) => Value::Constant(op.apply(c[0], c[1])),
        Operands::Array(x) => {
            Value::Array(kernels::zip2(op.label(), &x[0], &x[1], |p, q| op.apply(p, q))?)
        }
        Operands::Symbolic(graph, t) => Value::Symbolic(graph.apply(Binary(op), &[&t[0], &t[1]])?),
    })
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> OverrideResult<Value> {
    Ok(match promote(op.label(), &[a, b])? {
        Operands::Constant(c) => Value::Constant(op.apply(c[0], c[1])),
        Operands::Array(x) => {
            Value::Array(kernels::zip2(op.label(), &x[0], &x[1], |p, q| op.apply(p, q))?)
        }
        Operands::Symbolic(graph, t) => {
            Value::Symbolic(graph.apply(StraightThrough(Compare(op)), &[&t[0], &t[1]])?)
        }
    })
}

pub fn neg(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Neg, false)
}

pub fn abs(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Abs, false)
}

pub fn sqrt(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Sqrt, false)
}

pub fn square(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Square, false)
}

pub fn exp2(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Exp2, false)
}

pub fn sign(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Sign, false)
}

pub fn floor(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Floor, true)
}

pub fn ceil(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Ceil, true)
}

/// Round half to even.
pub fn round(value: &Value) -> OverrideResult<Value> {
    unary(value, UnaryOp::Round, true)
}

/// Logarithm in an arbitrary base.
pub fn log(value: &Value, base: f64) -> OverrideResult<Value> {
    if !(base > 0.0 && base != 1.0) {
        return Err(OverrideError::invalid(
            "log",
            format!("base must be positive and not 1, got {base}"),
        ));
    }
    if base == 2.0 {
        return unary(value, UnaryOp::Log2, false);
    }
    let ln = unary(value, UnaryOp::Ln, false)?;
    div(&ln, &Value::Constant(base.ln()))
}

pub fn add(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Add, a, b)
}

pub fn sub(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Sub, a, b)
}

pub fn mul(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Mul, a, b)
}

pub fn div(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Div, a, b)
}

pub fn pow(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Pow, a, b)
}

pub fn minimum(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Minimum, a, b)
}

pub fn maximum(a: &Value, b: &Value) -> OverrideResult<Value> {
    binary(BinaryOp::Maximum, a, b)
}

pub fn equal(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::Equal, a, b)
}

pub fn not_equal(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::NotEqual, a, b)
}

pub fn greater(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::Greater, a, b)
}

pub fn greater_equal(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::GreaterEqual, a, b)
}

pub fn less(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::Less, a, b)
}

pub fn less_equal(a: &Value, b: &Value) -> OverrideResult<Value> {
    compare(CompareOp::LessEqual, a, b)
}

pub fn logical_and(a: &Value, b: &Value) -> OverrideResult<Value> {
    require_non_constant("logical_and", &[a, b])?;
    binary(BinaryOp::LogicalAnd, a, b)
}

pub fn logical_or(a: &Value, b: &Value) -> OverrideResult<Value> {
    require_non_constant("logical_or", &[a, b])?;
    binary(BinaryOp::LogicalOr, a, b)
}

pub fn logical_not(value: &Value) -> OverrideResult<Value> {
    require_non_constant("logical_not", &[value])?;
    unary(value, UnaryOp::LogicalNot, false)
}

/// Elementwise selection. Undefined when every operand is a constant.
pub fn where_(cond: &Value, a: &Value, b: &Value) -> OverrideResult<Value> {
    require_non_constant("where", &[cond, a, b])?;
    Ok(match promote("where", &[cond, a, b])? {
        Operands::Constant(_) => return Err(OverrideError::DomainMismatch { op: "where" }),
        Operands::Array(x) => Value::Array(kernels::zip3("where", &x[0], &x[1], &x[2], |c, p, q| {
            if c != 0.0 {
                p
            } else {
                q
            }
        })?),
        Operands::Symbolic(graph, t) => {
            Value::Symbolic(graph.apply(Select, &[&t[0], &t[1], &t[2]])?)
        }
    })
}

/// Clamps `value` into `[lo, hi]`. With `transparent_backprop` the symbolic
/// form passes gradients through unchanged, saturated or not.
pub fn clip_by_value(
    value: &Value,
    lo: &Value,
    hi: &Value,
    transparent_backprop: bool,
) -> OverrideResult<Value> {
    Ok(match promote("clip_by_value", &[value, lo, hi])? {
        Operands::Constant(c) => Value::Constant(c[0].max(c[1]).min(c[2])),
        Operands::Array(x) => Value::Array(kernels::zip3(
            "clip_by_value",
            &x[0],
            &x[1],
            &x[2],
            |v, l, h| v.max(l).min(h),
        )?),
        Operands::Symbolic(graph, t) => {
            let inputs = [&t[0], &t[1], &t[2]];
            Value::Symbolic(if transparent_backprop {
                graph.apply(StraightThrough(Clip), &inputs)?
            } else {
                graph.apply(Clip, &inputs)?
            })
        }
    })
}

pub fn cast(value: &Value, dtype: DType) -> OverrideResult<Value> {
    Ok(match value {
        Value::Constant(c) => Value::Constant(dtype.convert(*c)),
        Value::Array(array) => Value::Array(array.mapv(|v| dtype.convert(v as f64) as f32)),
        Value::Symbolic(tensor) => Value::Symbolic(tensor.graph().apply(Cast(dtype), &[tensor])?),
    })
}

/// Identity that blocks gradients; a no-op outside the symbolic domain.
pub fn stop_gradient(value: &Value) -> OverrideResult<Value> {
    Ok(match value {
        Value::Symbolic(tensor) => {
            Value::Symbolic(tensor.graph().apply(StopGradient, &[tensor])?)
        }
        other => other.clone(),
    })
}

/// Evaluates to `forward`; the gradient of `through` is added to whatever
/// flows through `forward`. Detach `forward` for a pure estimator.
pub fn straight_through(forward: &Value, through: &Value) -> OverrideResult<Value> {
    if !forward.is_symbolic() && !through.is_symbolic() {
        return Ok(forward.clone());
    }
    let detached = stop_gradient(through)?;
    let delta = sub(through, &detached)?;
    add(forward, &delta)
}

pub fn reshape(value: &Value, shape: &[usize]) -> OverrideResult<Value> {
    Ok(match value {
        Value::Constant(c) => {
            if shape.iter().product::<usize>() != 1 {
                return Err(OverrideError::shape("reshape", &[], shape));
            }
            Value::Array(ArrayD::from_elem(IxDyn(shape), *c as f32))
        }
        Value::Array(array) => Value::Array(primitive::reshape(array, shape)?),
        Value::Symbolic(tensor) => {
            Value::Symbolic(tensor.graph().apply(Reshape(shape.to_vec()), &[tensor])?)
        }
    })
}

pub fn matmul(a: &Value, b: &Value) -> OverrideResult<Value> {
    Ok(match promote("matmul", &[a, b])? {
        Operands::Constant(_) => {
            return Err(OverrideError::UnsupportedOperation {
                op: "matmul",
                domain: Domain::Constant,
            })
        }
        Operands::Array(x) => Value::Array(kernels::matmul(&x[0], &x[1])?),
        Operands::Symbolic(graph, t) => Value::Symbolic(graph.apply(MatMul, &[&t[0], &t[1]])?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn arithmetic_promotes_to_widest_domain() {
        let a = Value::from(array![1.0f32, 2.0].into_dyn());
        let out = add(&a, &Value::Constant(0.5)).unwrap();
        assert_eq!(out.domain(), Domain::ImmediateArray);
        assert_eq!(out.evaluate().unwrap(), array![1.5f32, 2.5].into_dyn());
    }

    #[test]
    fn where_requires_a_non_constant_operand() {
        let err = where_(
            &Value::Constant(1.0),
            &Value::Constant(2.0),
            &Value::Constant(3.0),
        )
        .unwrap_err();
        assert!(matches!(err, OverrideError::DomainMismatch { op: "where" }));
        let cond = Value::from(array![1.0f32, 0.0].into_dyn());
        let out = where_(&cond, &Value::Constant(2.0), &Value::Constant(3.0)).unwrap();
        assert_eq!(out.evaluate().unwrap(), array![2.0f32, 3.0].into_dyn());
    }

    #[test]
    fn transparent_clip_keeps_gradient_outside_range() {
        let graph = Graph::new();
        let w = graph.variable("w", array![-3.0f32, 0.5, 3.0].into_dyn(), true);
        let x = Value::from(w.clone());
        let lo = Value::Constant(-1.0);
        let hi = Value::Constant(1.0);
        let plain = clip_by_value(&x, &lo, &hi, false).unwrap();
        let ste = clip_by_value(&x, &lo, &hi, true).unwrap();
        let g_plain = graph.gradients(plain.as_tensor().unwrap(), &[&w]).unwrap();
        let g_ste = graph.gradients(ste.as_tensor().unwrap(), &[&w]).unwrap();
        assert_eq!(g_plain[0], array![0.0f32, 1.0, 0.0].into_dyn());
        assert_eq!(g_ste[0], array![1.0f32, 1.0, 1.0].into_dyn());
        assert_eq!(ste.evaluate().unwrap(), array![-1.0f32, 0.5, 1.0].into_dyn());
    }

    #[test]
    fn straight_through_takes_value_of_forward_and_gradient_of_through() {
        let graph = Graph::new();
        let w = graph.variable("w", array![0.25f32, 0.75].into_dyn(), true);
        let x = Value::from(w.clone());
        let fwd = mul(&x, &Value::Constant(0.0)).unwrap();
        let out = straight_through(&fwd, &x).unwrap();
        assert_eq!(out.evaluate().unwrap(), array![0.0f32, 0.0].into_dyn());
        let g = graph.gradients(out.as_tensor().unwrap(), &[&w]).unwrap();
        assert_eq!(g[0], array![1.0f32, 1.0].into_dyn());
    }

    #[test]
    fn log_changes_base() {
        let out = log(&Value::Constant(8.0), 2.0).unwrap();
        assert_abs_diff_eq!(out.to_scalar().unwrap(), 3.0, epsilon = 1e-12);
        assert!(log(&Value::Constant(8.0), 1.0).is_err());
    }

    #[test]
    fn matmul_rejects_constants() {
        let err = matmul(&Value::Constant(1.0), &Value::Constant(2.0)).unwrap_err();
        assert!(matches!(err, OverrideError::UnsupportedOperation { .. }));
    }
}
