// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The three value domains every dispatcher function accepts.

use std::fmt;

use ndarray::{ArrayD, IxDyn};

use crate::error::{OverrideError, OverrideResult};
use crate::graph::{Graph, Tensor};

/// Domain tag, ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    Constant,
    ImmediateArray,
    SymbolicTensor,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Constant => "constant",
            Domain::ImmediateArray => "immediate array",
            Domain::SymbolicTensor => "symbolic tensor",
        })
    }
}

/// Target element type for [`crate::ops::cast`]. Storage stays floating point
/// in every domain; booleans are encoded as 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float,
    Int,
    Bool,
}

impl DType {
    #[inline]
    pub fn convert(self, x: f64) -> f64 {
        match self {
            DType::Float => x,
            DType::Int => x.trunc(),
            DType::Bool => {
                if x != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// A scalar constant, an eagerly evaluated array, or a node of a graph.
#[derive(Debug, Clone)]
pub enum Value {
    Constant(f64),
    Array(ArrayD<f32>),
    Symbolic(Tensor),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Constant(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Constant(value as f64)
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(value: ArrayD<f32>) -> Self {
        Value::Array(value)
    }
}

impl From<Tensor> for Value {
    fn from(value: Tensor) -> Self {
        Value::Symbolic(value)
    }
}

impl Value {
    pub fn domain(&self) -> Domain {
        match self {
            Value::Constant(_) => Domain::Constant,
            Value::Array(_) => Domain::ImmediateArray,
            Value::Symbolic(_) => Domain::SymbolicTensor,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Value::Constant(_))
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Value::Symbolic(_))
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Constant(_) => Vec::new(),
            Value::Array(array) => array.shape().to_vec(),
            Value::Symbolic(tensor) => tensor.shape().to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Symbolic(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.as_tensor().map(Tensor::graph)
    }

    /// Materialises the value as an array, evaluating symbolic tensors.
    pub fn evaluate(&self) -> OverrideResult<ArrayD<f32>> {
        match self {
            Value::Constant(c) => Ok(ArrayD::from_elem(IxDyn(&[]), *c as f32)),
            Value::Array(array) => Ok(array.clone()),
            Value::Symbolic(tensor) => tensor.eval(),
        }
    }

    /// Scalar view of a constant or of any single-element value.
    pub fn to_scalar(&self) -> OverrideResult<f64> {
        match self {
            Value::Constant(c) => Ok(*c),
            other => {
                let array = other.evaluate()?;
                match array.len() {
                    1 => Ok(array.iter().next().copied().unwrap_or_default() as f64),
                    n => Err(OverrideError::invalid(
                        "to_scalar",
                        format!("expected a single element, got {n}"),
                    )),
                }
            }
        }
    }

    /// Whether `other` designates the same parameter binding.
    pub fn same_binding(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Constant(a), Value::Constant(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Symbolic(a), Value::Symbolic(b)) => a.same_node(b),
            _ => false,
        }
    }

    /// Like-shaped value in the same domain, filled with `fill`. Symbolic
    /// inputs produce a constant node in the same graph.
    pub fn filled_like(&self, fill: f32) -> Value {
        let array = ArrayD::from_elem(IxDyn(&self.shape()), fill);
        match self {
            Value::Constant(_) => Value::Constant(fill as f64),
            Value::Array(_) => Value::Array(array),
            Value::Symbolic(tensor) => Value::Symbolic(tensor.graph().constant(array)),
        }
    }
}

/// Operands lifted into their widest common domain.
pub(crate) enum Operands {
    Constant(Vec<f64>),
    Array(Vec<ArrayD<f32>>),
    Symbolic(Graph, Vec<Tensor>),
}

/// Promotes operands to the widest domain among them. Constants and arrays
/// join a symbolic operand's graph as constant nodes.
pub(crate) fn promote(op: &'static str, values: &[&Value]) -> OverrideResult<Operands> {
    let widest = values
        .iter()
        .map(|v| v.domain())
        .max()
        .unwrap_or(Domain::Constant);
    match widest {
        Domain::Constant => Ok(Operands::Constant(
            values
                .iter()
                .map(|v| match v {
                    Value::Constant(c) => *c,
                    _ => 0.0,
                })
                .collect(),
        )),
        Domain::ImmediateArray => Ok(Operands::Array(
            values
                .iter()
                .map(|v| match v {
                    Value::Constant(c) => ArrayD::from_elem(IxDyn(&[]), *c as f32),
                    Value::Array(array) => array.clone(),
                    Value::Symbolic(_) => ArrayD::zeros(IxDyn(&[])),
                })
                .collect(),
        )),
        Domain::SymbolicTensor => {
            let graph = values
                .iter()
                .find_map(|v| v.graph())
                .cloned()
                .ok_or(OverrideError::GraphMismatch { op })?;
            let mut tensors = Vec::with_capacity(values.len());
            for value in values {
                let tensor = match value {
                    Value::Constant(c) => graph.scalar(*c as f32),
                    Value::Array(array) => graph.constant(array.clone()),
                    Value::Symbolic(tensor) => {
                        if !tensor.graph().ptr_eq(&graph) {
                            return Err(OverrideError::GraphMismatch { op });
                        }
                        tensor.clone()
                    }
                };
                tensors.push(tensor);
            }
            Ok(Operands::Symbolic(graph, tensors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn domains_are_ordered_by_width() {
        assert!(Domain::Constant < Domain::ImmediateArray);
        assert!(Domain::ImmediateArray < Domain::SymbolicTensor);
    }

    #[test]
    fn promotion_lifts_arrays_into_the_graph() {
        let graph = Graph::new();
        let t = Value::from(graph.variable("x", array![1.0f32].into_dyn(), false));
        let a = Value::from(array![2.0f32].into_dyn());
        match promote("test", &[&a, &t]).unwrap() {
            Operands::Symbolic(g, tensors) => {
                assert!(g.ptr_eq(&graph));
                assert_eq!(tensors.len(), 2);
            }
            _ => panic!("expected symbolic operands"),
        }
    }

    #[test]
    fn casting_truncates_and_binarises() {
        assert_eq!(DType::Int.convert(-2.7), -2.0);
        assert_eq!(DType::Bool.convert(0.2), 1.0);
        assert_eq!(DType::Bool.convert(0.0), 0.0);
    }
}
