// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Graph primitives. Each primitive declares its forward kernel and its
//! backward rule in one place; gradient overrides are expressed by wrapping a
//! primitive in [`StraightThrough`] rather than by patching the graph.

use std::cell::RefCell;

use ndarray::{ArrayD, IxDyn, Zip};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{OverrideError, OverrideResult};
use crate::kernels::{
    self, broadcast_shape, BinaryOp, CompareOp, ReduceOp, UnaryOp,
};
use crate::value::DType;

/// Gradients returned by a primitive, one slot per input. `None` marks an
/// input that receives no gradient.
pub type Gradients = Vec<Option<ArrayD<f32>>>;

/// Nodes implement this trait to participate in evaluation and backprop.
pub trait Primitive {
    fn name(&self) -> &'static str;

    /// Infers the output shape from the input shapes.
    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>>;

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>>;

    /// Maps the output gradient onto the inputs. Gradients may have the
    /// broadcast output shape; the engine reduces them to each input shape.
    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients>;
}

/// Declares an identity backward for the first operand of `P` while keeping
/// the forward kernel of `P`.
#[derive(Debug, Clone)]
pub struct StraightThrough<P>(pub P);

impl<P: Primitive> Primitive for StraightThrough<P> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        self.0.output_shape(inputs)
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        self.0.forward(inputs)
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let mut grads: Gradients = vec![None; inputs.len()];
        if let Some(first) = grads.first_mut() {
            *first = Some(grad.clone());
        }
        Ok(grads)
    }
}

fn expect_arity(name: &'static str, inputs: usize, expected: usize) -> OverrideResult<()> {
    if inputs != expected {
        return Err(OverrideError::invalid(
            name,
            format!("expected {expected} operands, got {inputs}"),
        ));
    }
    Ok(())
}

/// Elementwise single-operand primitive.
#[derive(Debug, Clone, Copy)]
pub struct Unary(pub UnaryOp);

impl Primitive for Unary {
    fn name(&self) -> &'static str {
        self.0.label()
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        Ok(inputs[0].to_vec())
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        Ok(kernels::map(inputs[0], self.0))
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let x = inputs[0];
        let dx = match self.0 {
            UnaryOp::Neg => Some(grad.mapv(|g| -g)),
            UnaryOp::Abs => Some(grad * &x.mapv(|v| kernels::sign(v as f64) as f32)),
            UnaryOp::Sqrt => Some(Zip::from(grad).and(output).map_collect(|&g, &y| {
                if y > 0.0 {
                    g * 0.5 / y
                } else {
                    0.0
                }
            })),
            UnaryOp::Ln => Some(grad / x),
            UnaryOp::Log2 => Some(grad / &x.mapv(|v| v * std::f32::consts::LN_2)),
            UnaryOp::Exp2 => Some(grad * output * std::f32::consts::LN_2),
            UnaryOp::Square => Some(grad * &x.mapv(|v| 2.0 * v)),
            UnaryOp::Floor
            | UnaryOp::Ceil
            | UnaryOp::Round
            | UnaryOp::Sign
            | UnaryOp::LogicalNot => None,
        };
        Ok(vec![dx])
    }
}

/// Elementwise two-operand primitive with broadcasting.
#[derive(Debug, Clone, Copy)]
pub struct Binary(pub BinaryOp);

impl Primitive for Binary {
    fn name(&self) -> &'static str {
        self.0.label()
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 2)?;
        broadcast_shape(self.name(), inputs[0], inputs[1])
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let op = self.0;
        kernels::zip2(op.label(), inputs[0], inputs[1], |a, b| op.apply(a, b))
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let (a, b) = (inputs[0], inputs[1]);
        let name = self.name();
        let grads = match self.0 {
            BinaryOp::Add => vec![Some(grad.clone()), Some(grad.clone())],
            BinaryOp::Sub => vec![Some(grad.clone()), Some(grad.mapv(|g| -g))],
            BinaryOp::Mul => vec![
                Some(kernels::zip2(name, grad, b, |g, y| g * y)?),
                Some(kernels::zip2(name, grad, a, |g, x| g * x)?),
            ],
            BinaryOp::Div => {
                let da = kernels::zip2(name, grad, b, |g, y| g / y)?;
                let ratio = kernels::zip2(name, a, b, |x, y| x / (y * y))?;
                let db = kernels::zip2(name, grad, &ratio, |g, r| -g * r)?;
                vec![Some(da), Some(db)]
            }
            BinaryOp::Pow => {
                let da = kernels::zip3(name, grad, a, b, |g, x, y| g * y * x.powf(y - 1.0))?;
                let db = kernels::zip3(name, grad, output, a, |g, out, x| {
                    if x > 0.0 {
                        g * out * x.ln()
                    } else {
                        0.0
                    }
                })?;
                vec![Some(da), Some(db)]
            }
            BinaryOp::Minimum | BinaryOp::Maximum => {
                let pick_a = if self.0 == BinaryOp::Minimum {
                    CompareOp::LessEqual
                } else {
                    CompareOp::GreaterEqual
                };
                let mask = kernels::zip2(name, a, b, |x, y| pick_a.apply(x, y))?;
                let da = kernels::zip2(name, grad, &mask, |g, m| g * m)?;
                let db = kernels::zip2(name, grad, &mask, |g, m| g * (1.0 - m))?;
                vec![Some(da), Some(db)]
            }
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => vec![None, None],
        };
        Ok(grads)
    }
}

/// Elementwise comparison producing a 0/1 mask.
#[derive(Debug, Clone, Copy)]
pub struct Compare(pub CompareOp);

impl Primitive for Compare {
    fn name(&self) -> &'static str {
        self.0.label()
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 2)?;
        broadcast_shape(self.name(), inputs[0], inputs[1])
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let op = self.0;
        kernels::zip2(op.label(), inputs[0], inputs[1], |a, b| op.apply(a, b))
    }

    fn backward(
        &self,
        _inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        _grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(vec![None, None])
    }
}

/// `where(cond, a, b)` selection.
#[derive(Debug, Clone, Copy)]
pub struct Select;

impl Primitive for Select {
    fn name(&self) -> &'static str {
        "where"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 3)?;
        let shape = broadcast_shape(self.name(), inputs[0], inputs[1])?;
        broadcast_shape(self.name(), &shape, inputs[2])
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        kernels::zip3("where", inputs[0], inputs[1], inputs[2], |c, a, b| {
            if c != 0.0 {
                a
            } else {
                b
            }
        })
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let cond = inputs[0];
        let da = kernels::zip2("where", grad, cond, |g, c| if c != 0.0 { g } else { 0.0 })?;
        let db = kernels::zip2("where", grad, cond, |g, c| if c != 0.0 { 0.0 } else { g })?;
        Ok(vec![None, Some(da), Some(db)])
    }
}

/// `clip(x, lo, hi)`; the plain form passes gradients only inside the range.
#[derive(Debug, Clone, Copy)]
pub struct Clip;

impl Primitive for Clip {
    fn name(&self) -> &'static str {
        "clip_by_value"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 3)?;
        let shape = broadcast_shape(self.name(), inputs[0], inputs[1])?;
        broadcast_shape(self.name(), &shape, inputs[2])
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        kernels::zip3(self.name(), inputs[0], inputs[1], inputs[2], |x, lo, hi| {
            x.max(lo).min(hi)
        })
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let inside = kernels::zip3(self.name(), inputs[0], inputs[1], inputs[2], |x, lo, hi| {
            kernels::truth(x >= lo && x <= hi)
        })?;
        let dx = kernels::zip2(self.name(), grad, &inside, |g, m| g * m)?;
        Ok(vec![Some(dx), None, None])
    }
}

/// Axis reduction.
#[derive(Debug, Clone)]
pub struct Reduce {
    pub op: ReduceOp,
    pub axes: Option<Vec<usize>>,
    pub keep_dims: bool,
}

impl Primitive for Reduce {
    fn name(&self) -> &'static str {
        self.op.label()
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        let axes = kernels::normalize_axes(self.name(), inputs[0].len(), self.axes.as_deref())?;
        Ok(kernels::reduced_shape(inputs[0], &axes, self.keep_dims))
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let x = inputs[0];
        let axes = kernels::normalize_axes(self.name(), x.ndim(), self.axes.as_deref())?;
        Ok(kernels::reduce(x, &axes, self.keep_dims, self.op))
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let x = inputs[0];
        let axes = kernels::normalize_axes(self.name(), x.ndim(), self.axes.as_deref())?;
        let kept = kernels::reduced_shape(x.shape(), &axes, true);
        let grad = reshape(grad, &kept)?;
        let count: usize = axes.iter().map(|&axis| x.shape()[axis]).product();
        let dx = match self.op {
            ReduceOp::Sum => kernels::zip2(self.name(), x, &grad, |_, g| g)?,
            ReduceOp::Mean => {
                let count = count.max(1) as f64;
                kernels::zip2(self.name(), x, &grad, |_, g| g / count)?
            }
            ReduceOp::Max | ReduceOp::Min => {
                let output = reshape(output, &kept)?;
                let hit = kernels::zip2(self.name(), x, &output, |v, o| kernels::truth(v == o))?;
                kernels::zip2(self.name(), &hit, &grad, |h, g| h * g)?
            }
        };
        Ok(vec![Some(dx)])
    }
}

/// Row-major reshape.
#[derive(Debug, Clone)]
pub struct Reshape(pub Vec<usize>);

impl Primitive for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        let from: usize = inputs[0].iter().product();
        let to: usize = self.0.iter().product();
        if from != to {
            return Err(OverrideError::shape(self.name(), inputs[0], &self.0));
        }
        Ok(self.0.clone())
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        reshape(inputs[0], &self.0)
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(vec![Some(reshape(grad, inputs[0].shape())?)])
    }
}

pub(crate) fn reshape(x: &ArrayD<f32>, shape: &[usize]) -> OverrideResult<ArrayD<f32>> {
    let flat: Vec<f32> = x.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(shape), flat)
        .map_err(|_| OverrideError::shape("reshape", x.shape(), shape))
}

/// 2-D matrix product.
#[derive(Debug, Clone, Copy)]
pub struct MatMul;

impl Primitive for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 2)?;
        match (inputs[0], inputs[1]) {
            ([m, k], [k2, n]) if k == k2 => Ok(vec![*m, *n]),
            (left, right) => Err(OverrideError::shape(self.name(), left, right)),
        }
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        kernels::matmul(inputs[0], inputs[1])
    }

    fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        let da = kernels::matmul(grad, &kernels::transpose2(inputs[1])?)?;
        let db = kernels::matmul(&kernels::transpose2(inputs[0])?, grad)?;
        Ok(vec![Some(da), Some(db)])
    }
}

/// Identity forward, no gradient.
#[derive(Debug, Clone, Copy)]
pub struct StopGradient;

impl Primitive for StopGradient {
    fn name(&self) -> &'static str {
        "stop_gradient"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        Ok(inputs[0].to_vec())
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        Ok(inputs[0].clone())
    }

    fn backward(
        &self,
        _inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        _grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(vec![None])
    }
}

/// Scalar `k`-th largest value of the flattened operand.
#[derive(Debug, Clone, Copy)]
pub struct TopK(pub usize);

impl Primitive for TopK {
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        let total: usize = inputs[0].iter().product();
        if self.0 == 0 || self.0 > total {
            return Err(OverrideError::invalid(
                "top_k",
                format!("k={} outside 1..={total}", self.0),
            ));
        }
        Ok(Vec::new())
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let threshold = kernels::top_k_threshold(inputs[0], self.0)?;
        Ok(ArrayD::from_elem(IxDyn(&[]), threshold))
    }

    fn backward(
        &self,
        _inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        _grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(vec![None])
    }
}

/// Element type conversion on the 0/1-encoded float storage.
#[derive(Debug, Clone, Copy)]
pub struct Cast(pub DType);

impl Primitive for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 1)?;
        Ok(inputs[0].to_vec())
    }

    fn forward(&self, inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let dtype = self.0;
        Ok(inputs[0].mapv(|v| dtype.convert(v as f64) as f32))
    }

    fn backward(
        &self,
        _inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(match self.0 {
            DType::Float => vec![Some(grad.clone())],
            DType::Int | DType::Bool => vec![None],
        })
    }
}

/// Draws fresh uniform samples in `[0, 1)` on every evaluation.
#[derive(Debug)]
pub struct RandomUniform {
    shape: Vec<usize>,
    rng: RefCell<StdRng>,
}

impl RandomUniform {
    pub fn new(shape: Vec<usize>, rng: StdRng) -> Self {
        Self {
            shape,
            rng: RefCell::new(rng),
        }
    }
}

impl Primitive for RandomUniform {
    fn name(&self) -> &'static str {
        "random_uniform"
    }

    fn output_shape(&self, inputs: &[&[usize]]) -> OverrideResult<Vec<usize>> {
        expect_arity(self.name(), inputs.len(), 0)?;
        Ok(self.shape.clone())
    }

    fn forward(&self, _inputs: &[&ArrayD<f32>]) -> OverrideResult<ArrayD<f32>> {
        let mut rng = self.rng.borrow_mut();
        Ok(ArrayD::from_shape_fn(IxDyn(&self.shape), |_| rng.gen::<f32>()))
    }

    fn backward(
        &self,
        _inputs: &[&ArrayD<f32>],
        _output: &ArrayD<f32>,
        _grad: &ArrayD<f32>,
    ) -> OverrideResult<Gradients> {
        Ok(Vec::new())
    }
}
