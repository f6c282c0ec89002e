// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter overriders for compression-aware training.
//!
//! An overrider sits between a parameter and the layer that consumes it and
//! hands the layer a quantized, pruned or factorised version instead. The
//! same overrider works on three value domains:
//!
//! * plain scalars ([`Value::Constant`]),
//! * immediate `ndarray` tensors ([`Value::Array`]),
//! * tensors of a differentiable [`Graph`] ([`Value::Symbolic`]).
//!
//! The [`ops`] dispatcher promotes mixed operands to the widest domain, and in
//! the symbolic domain rounding, clipping and comparisons carry
//! straight-through gradients, so quantized parameters stay trainable.

pub mod config;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod lra;
pub mod ops;
pub mod overrider;
pub mod prune;
pub mod quantize;
pub mod report;
pub mod value;

pub use config::{build_overrider, build_transform, OverriderConfig, PointConfig, Trainable};
pub use error::{OverrideError, OverrideResult};
pub use graph::{Graph, Tensor};
pub use lra::LowRankApproximation;
pub use overrider::{
    ChainOverrider, EmptyOverrider, Overrider, Overriding, Scope, StateVariable, Transform,
};
pub use prune::{
    DynamicNetworkSurgeryPruner, FilterNorm, FilterPruner, MeanStdPruner, NetworkSlimmer,
};
pub use quantize::{
    CentroidMode, CourbariauxQuantizer, DGQuantizer, DGTrainableQuantizer, FixedPointQuantizer,
    FloatingPointQuantizer, IncrementalQuantizer, LogQuantizer, MixedQuantizer, Point,
    Recentralizer, SelectionPolicy, ShiftQuantizer,
};
pub use report::{CompressionReport, OverrideReport};
pub use value::{DType, Domain, Value};
