// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Value-domain dispatcher.
//!
//! Every function accepts [`Value`] operands, promotes them to the widest
//! domain present and routes to the scalar kernel, the eager array kernel or
//! a graph primitive. Floor, ceil, round and comparisons are always recorded
//! as straight-through primitives in the symbolic domain.

mod math;
mod random;
mod reduce;

pub use math::{
    abs, add, cast, ceil, clip_by_value, div, equal, exp2, floor, greater, greater_equal, less,
    less_equal, log, logical_and, logical_not, logical_or, matmul, maximum, minimum, mul, neg,
    not_equal, pow, reshape, round, sign, sqrt, square, stop_gradient, straight_through, sub,
    where_,
};
pub use random::{random_uniform, stochastic_round, RoundingMode};
pub use reduce::{count, mean, moments, nonzero, reduce_max, reduce_min, sum, top_k};

use crate::error::{OverrideError, OverrideResult};
use crate::value::Value;

/// Fails with `DomainMismatch` when every operand is a plain constant.
pub(crate) fn require_non_constant(op: &'static str, values: &[&Value]) -> OverrideResult<()> {
    if values.iter().all(|v| v.is_constant()) {
        return Err(OverrideError::DomainMismatch { op });
    }
    Ok(())
}
