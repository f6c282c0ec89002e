// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Deferred, differentiable computation graph backing the symbolic value
//! domain.
//!
//! A [`Graph`] is an explicit context created by the caller and shared by
//! handle. Nodes are appended in dependency order, so node ids are already a
//! topological order and both evaluation and backprop walk them linearly.
//! Variables own mutable storage; everything else is recomputed from the
//! current variable contents on every [`Graph::eval`].

pub mod primitive;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};

use crate::error::{OverrideError, OverrideResult};
use crate::kernels;
use primitive::Primitive;

enum NodeKind {
    Variable {
        name: String,
        value: ArrayD<f32>,
        trainable: bool,
    },
    Constant(ArrayD<f32>),
    Op {
        primitive: Rc<dyn Primitive>,
        inputs: Vec<usize>,
    },
}

struct Node {
    kind: NodeKind,
    shape: Vec<usize>,
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<Node>,
}

/// Shared handle to a computation graph.
#[derive(Clone, Default)]
pub struct Graph(Rc<RefCell<GraphState>>);

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Graph(nodes={})", self.len())
    }
}

/// Handle to one node of a [`Graph`].
#[derive(Clone)]
pub struct Tensor {
    graph: Graph,
    id: usize,
    shape: Vec<usize>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(id={}, shape={:?})", self.id, self.shape)
    }
}

impl Tensor {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Evaluates this tensor against the current variable storage.
    pub fn eval(&self) -> OverrideResult<ArrayD<f32>> {
        self.graph.eval(self)
    }

    pub fn is_variable(&self) -> bool {
        self.graph.is_variable(self)
    }

    /// Whether both handles point at the same node of the same graph.
    pub fn same_node(&self, other: &Tensor) -> bool {
        self.graph.ptr_eq(&other.graph) && self.id == other.id
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ptr_eq(&self, other: &Graph) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, kind: NodeKind, shape: Vec<usize>) -> Tensor {
        let mut state = self.0.borrow_mut();
        let id = state.nodes.len();
        state.nodes.push(Node {
            kind,
            shape: shape.clone(),
        });
        Tensor {
            graph: self.clone(),
            id,
            shape,
        }
    }

    /// Creates a variable holding `value`.
    pub fn variable(&self, name: impl Into<String>, value: ArrayD<f32>, trainable: bool) -> Tensor {
        let shape = value.shape().to_vec();
        self.push(
            NodeKind::Variable {
                name: name.into(),
                value,
                trainable,
            },
            shape,
        )
    }

    pub fn constant(&self, value: ArrayD<f32>) -> Tensor {
        let shape = value.shape().to_vec();
        self.push(NodeKind::Constant(value), shape)
    }

    pub fn scalar(&self, value: f32) -> Tensor {
        self.constant(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Appends a primitive application.
    pub fn apply<P: Primitive + 'static>(
        &self,
        primitive: P,
        inputs: &[&Tensor],
    ) -> OverrideResult<Tensor> {
        if inputs.iter().any(|t| !t.graph.ptr_eq(self)) {
            return Err(OverrideError::GraphMismatch {
                op: primitive.name(),
            });
        }
        let shapes: Vec<&[usize]> = inputs.iter().map(|t| t.shape()).collect();
        let shape = primitive.output_shape(&shapes)?;
        Ok(self.push(
            NodeKind::Op {
                primitive: Rc::new(primitive),
                inputs: inputs.iter().map(|t| t.id).collect(),
            },
            shape,
        ))
    }

    pub fn is_variable(&self, tensor: &Tensor) -> bool {
        tensor.graph.ptr_eq(self)
            && matches!(
                self.0.borrow().nodes.get(tensor.id).map(|n| &n.kind),
                Some(NodeKind::Variable { .. })
            )
    }

    /// Name of a variable node, if `tensor` is one.
    pub fn variable_name(&self, tensor: &Tensor) -> Option<String> {
        match self.0.borrow().nodes.get(tensor.id).map(|n| &n.kind) {
            Some(NodeKind::Variable { name, .. }) => Some(name.clone()),
            _ => None,
        }
    }

    pub fn find_variable(&self, name: &str) -> Option<Tensor> {
        let state = self.0.borrow();
        state.nodes.iter().enumerate().find_map(|(id, node)| match &node.kind {
            NodeKind::Variable { name: n, .. } if n == name => Some(Tensor {
                graph: self.clone(),
                id,
                shape: node.shape.clone(),
            }),
            _ => None,
        })
    }

    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.variables_where(|trainable| trainable)
    }

    /// Every variable, trainable or not, in creation order.
    pub fn variables(&self) -> Vec<Tensor> {
        self.variables_where(|_| true)
    }

    fn variables_where(&self, keep: impl Fn(bool) -> bool) -> Vec<Tensor> {
        let state = self.0.borrow();
        state
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| match node.kind {
                NodeKind::Variable { trainable, .. } => keep(trainable),
                _ => false,
            })
            .map(|(id, node)| Tensor {
                graph: self.clone(),
                id,
                shape: node.shape.clone(),
            })
            .collect()
    }

    /// Overwrites the storage of a variable.
    pub fn assign(&self, tensor: &Tensor, value: ArrayD<f32>) -> OverrideResult<()> {
        if !tensor.graph.ptr_eq(self) {
            return Err(OverrideError::GraphMismatch { op: "assign" });
        }
        let mut state = self.0.borrow_mut();
        let node = state
            .nodes
            .get_mut(tensor.id)
            .ok_or(OverrideError::NotVariable { id: tensor.id })?;
        if node.shape != value.shape() {
            return Err(OverrideError::shape("assign", &node.shape, value.shape()));
        }
        match &mut node.kind {
            NodeKind::Variable { value: slot, .. } => {
                *slot = value;
                Ok(())
            }
            _ => Err(OverrideError::NotVariable { id: tensor.id }),
        }
    }

    pub fn eval(&self, tensor: &Tensor) -> OverrideResult<ArrayD<f32>> {
        let mut values = self.forward(&[tensor])?;
        values
            .remove(&tensor.id)
            .ok_or(OverrideError::NotVariable { id: tensor.id })
    }

    pub fn eval_all(&self, tensors: &[&Tensor]) -> OverrideResult<Vec<ArrayD<f32>>> {
        let values = self.forward(tensors)?;
        tensors
            .iter()
            .map(|t| {
                values
                    .get(&t.id)
                    .cloned()
                    .ok_or(OverrideError::NotVariable { id: t.id })
            })
            .collect()
    }

    fn required(&self, roots: &[&Tensor]) -> OverrideResult<BTreeSet<usize>> {
        let state = self.0.borrow();
        let mut seen = BTreeSet::new();
        let mut stack = Vec::new();
        for root in roots {
            if !root.graph.ptr_eq(self) {
                return Err(OverrideError::GraphMismatch { op: "eval" });
            }
            stack.push(root.id);
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let NodeKind::Op { inputs, .. } = &state.nodes[id].kind {
                stack.extend(inputs.iter().copied());
            }
        }
        Ok(seen)
    }

    fn forward(&self, roots: &[&Tensor]) -> OverrideResult<HashMap<usize, ArrayD<f32>>> {
        let required = self.required(roots)?;
        let state = self.0.borrow();
        let mut values: HashMap<usize, ArrayD<f32>> = HashMap::with_capacity(required.len());
        for id in required {
            let value = match &state.nodes[id].kind {
                NodeKind::Variable { value, .. } => value.clone(),
                NodeKind::Constant(value) => value.clone(),
                NodeKind::Op { primitive, inputs } => {
                    let args: Vec<&ArrayD<f32>> = inputs.iter().map(|i| &values[i]).collect();
                    primitive.forward(&args)?
                }
            };
            values.insert(id, value);
        }
        Ok(values)
    }

    /// Reverse-mode gradients of `output` (seeded with ones) with respect to
    /// each tensor in `wrt`. Unreachable inputs receive zeros.
    pub fn gradients(&self, output: &Tensor, wrt: &[&Tensor]) -> OverrideResult<Vec<ArrayD<f32>>> {
        let values = self.forward(&[output])?;
        let state = self.0.borrow();
        let mut grads: HashMap<usize, ArrayD<f32>> = HashMap::new();
        grads.insert(output.id, ArrayD::ones(IxDyn(output.shape())));
        for id in (0..=output.id).rev() {
            let Some(grad) = grads.get(&id).cloned() else {
                continue;
            };
            let NodeKind::Op { primitive, inputs } = &state.nodes[id].kind else {
                continue;
            };
            let args: Vec<&ArrayD<f32>> = inputs.iter().map(|i| &values[i]).collect();
            let input_grads = primitive.backward(&args, &values[&id], &grad)?;
            for (&input, maybe) in inputs.iter().zip(input_grads) {
                let Some(g) = maybe else { continue };
                let g = kernels::reduce_to_shape(g, &state.nodes[input].shape);
                match grads.get_mut(&input) {
                    Some(acc) => *acc += &g,
                    None => {
                        grads.insert(input, g);
                    }
                }
            }
        }
        Ok(wrt
            .iter()
            .map(|t| {
                grads
                    .get(&t.id)
                    .cloned()
                    .unwrap_or_else(|| ArrayD::zeros(IxDyn(t.shape())))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::primitive::{Binary, StraightThrough, Unary};
    use super::*;
    use crate::kernels::{BinaryOp, UnaryOp};
    use ndarray::array;

    #[test]
    fn evaluation_tracks_variable_storage() {
        let graph = Graph::new();
        let w = graph.variable("w", array![1.0f32, 2.0].into_dyn(), true);
        let two = graph.scalar(2.0);
        let y = graph.apply(Binary(BinaryOp::Mul), &[&w, &two]).unwrap();
        assert_eq!(y.eval().unwrap(), array![2.0f32, 4.0].into_dyn());
        graph.assign(&w, array![3.0f32, 5.0].into_dyn()).unwrap();
        assert_eq!(y.eval().unwrap(), array![6.0f32, 10.0].into_dyn());
    }

    #[test]
    fn straight_through_floor_passes_gradient() {
        let graph = Graph::new();
        let w = graph.variable("w", array![0.3f32, 1.7].into_dyn(), true);
        let plain = graph.apply(Unary(UnaryOp::Floor), &[&w]).unwrap();
        let ste = graph
            .apply(StraightThrough(Unary(UnaryOp::Floor)), &[&w])
            .unwrap();
        let g_plain = graph.gradients(&plain, &[&w]).unwrap();
        let g_ste = graph.gradients(&ste, &[&w]).unwrap();
        assert!(g_plain[0].iter().all(|&g| g == 0.0));
        assert!(g_ste[0].iter().all(|&g| g == 1.0));
    }

    #[test]
    fn broadcast_gradients_are_reduced() {
        let graph = Graph::new();
        let w = graph.variable("w", array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn(), true);
        let b = graph.variable("b", array![10.0f32, 20.0].into_dyn(), true);
        let y = graph.apply(Binary(BinaryOp::Mul), &[&w, &b]).unwrap();
        let grads = graph.gradients(&y, &[&w, &b]).unwrap();
        assert_eq!(grads[1], array![4.0f32, 6.0].into_dyn());
        assert_eq!(grads[0], array![[10.0f32, 20.0], [10.0, 20.0]].into_dyn());
    }

    #[test]
    fn only_variables_accept_assignment() {
        let graph = Graph::new();
        let c = graph.scalar(1.0);
        let err = graph.assign(&c, ArrayD::zeros(IxDyn(&[]))).unwrap_err();
        assert!(matches!(err, OverrideError::NotVariable { .. }));
    }

    #[test]
    fn mixing_graphs_is_rejected() {
        let a = Graph::new();
        let b = Graph::new();
        let x = a.scalar(1.0);
        let y = b.scalar(2.0);
        let err = a.apply(Binary(BinaryOp::Add), &[&x, &y]).unwrap_err();
        assert!(matches!(err, OverrideError::GraphMismatch { .. }));
    }
}
