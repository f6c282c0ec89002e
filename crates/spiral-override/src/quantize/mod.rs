// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Quantizers. Every variant produces a dequantized value with the shape and
//! domain of its input, so downstream ops never see an encoded form.

mod binary;
mod fixed;
mod float;
mod incremental;
mod log;
mod mixed;
mod recentralize;

pub use binary::{CourbariauxQuantizer, DGQuantizer, DGTrainableQuantizer};
pub use fixed::{FixedPointQuantizer, Point};
pub use float::{FloatingPointQuantizer, ShiftQuantizer};
pub use incremental::{IncrementalQuantizer, SelectionPolicy};
pub use log::LogQuantizer;
pub use mixed::MixedQuantizer;
pub use recentralize::{CentroidMode, Recentralizer};

use ndarray::ArrayD;
use rand::rngs::StdRng;

use crate::error::{OverrideError, OverrideResult};
use crate::ops::{self, RoundingMode};
use crate::value::Value;

/// Elementwise selection that also accepts all-constant operands.
pub(crate) fn choose(cond: &Value, a: &Value, b: &Value) -> OverrideResult<Value> {
    match (cond, a, b) {
        (Value::Constant(c), Value::Constant(x), Value::Constant(y)) => {
            Ok(Value::Constant(if *c != 0.0 { *x } else { *y }))
        }
        _ => ops::where_(cond, a, b),
    }
}

/// Splits `value` into its sign and a magnitude that is 1 wherever the value
/// is 0, so logarithms stay finite.
pub(crate) fn sign_and_safe_magnitude(value: &Value) -> OverrideResult<(Value, Value)> {
    let sign = ops::sign(value)?;
    let magnitude = ops::abs(value)?;
    let is_zero = ops::equal(&magnitude, &Value::Constant(0.0))?;
    let safe = choose(&is_zero, &Value::Constant(1.0), &magnitude)?;
    Ok((sign, safe))
}

/// Integer code range of a signed `width`-bit fixed-point number.
pub(crate) fn code_range(width: u32) -> (f64, f64) {
    let half = 2f64.powi(width as i32 - 1);
    (-half, half - 1.0)
}

pub(crate) fn check_width(kind: &str, field: &str, width: u32) -> OverrideResult<()> {
    if !(1..=32).contains(&width) {
        return Err(OverrideError::config(format!(
            "{kind}: {field} must be within 1..=32, got {width}"
        )));
    }
    Ok(())
}

/// Signed fixed-point quantization with `width` bits of which `point` are
/// integer bits. `point` may be a graph variable; it is rounded with a
/// straight-through estimator. Saturates instead of wrapping.
pub(crate) fn fixed_point(
    value: &Value,
    width: u32,
    point: &Value,
    stochastic: Option<(RoundingMode, &mut StdRng)>,
) -> OverrideResult<Value> {
    let point = ops::round(point)?;
    let shift = ops::exp2(&ops::sub(&Value::Constant(width as f64), &point)?)?;
    let scaled = ops::mul(value, &shift)?;
    let rounded = match stochastic {
        Some((mode, rng)) => ops::stochastic_round(&scaled, mode, rng)?,
        None => ops::round(&scaled)?,
    };
    let (lo, hi) = code_range(width);
    let clipped = ops::clip_by_value(
        &rounded,
        &Value::Constant(lo),
        &Value::Constant(hi),
        true,
    )?;
    ops::div(&clipped, &shift)
}

/// Fraction of entries whose code falls outside the representable range.
pub(crate) fn overflow_rate(values: &ArrayD<f32>, width: u32, point: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let shift = (width as f64 - point.round_ties_even()).exp2();
    let (lo, hi) = code_range(width);
    let overflows = values
        .iter()
        .map(|&v| (v as f64 * shift).round_ties_even())
        .filter(|&code| code < lo || code > hi)
        .count();
    overflows as f64 / values.len() as f64
}

/// Largest magnitude of an evaluated value.
pub(crate) fn max_abs(values: &ArrayD<f32>) -> f64 {
    values.iter().fold(0.0f64, |acc, &v| acc.max((v as f64).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn fixed_point_rounds_and_saturates() {
        // 4 bits, 2 integer bits: step 0.25, range [-2, 1.75].
        let x = Value::from(array![0.3f32, -0.6, 5.0, -9.0].into_dyn());
        let q = fixed_point(&x, 4, &Value::Constant(2.0), None).unwrap();
        let q = q.evaluate().unwrap();
        assert_abs_diff_eq!(q[[0]], 0.25);
        assert_abs_diff_eq!(q[[1]], -0.5);
        assert_abs_diff_eq!(q[[2]], 1.75);
        assert_abs_diff_eq!(q[[3]], -2.0);
    }

    #[test]
    fn overflow_rate_counts_saturated_codes() {
        let x = array![0.3f32, -0.6, 5.0, -9.0].into_dyn();
        assert_eq!(overflow_rate(&x, 4, 2.0), 0.5);
    }

    #[test]
    fn choose_handles_plain_constants() {
        let out = choose(
            &Value::Constant(0.0),
            &Value::Constant(1.0),
            &Value::Constant(2.0),
        )
        .unwrap();
        assert_eq!(out.to_scalar().unwrap(), 2.0);
    }
}
