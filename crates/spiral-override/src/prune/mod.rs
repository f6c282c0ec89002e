// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pruners. Each keeps a `{0, 1}` mask as internal state and multiplies the
//! parameter by it. Masks never become empty: when a rule would prune every
//! entry, the largest-magnitude entry (or channel) survives.

mod channel;
mod mean_std;

pub use channel::{FilterNorm, FilterPruner, NetworkSlimmer};
pub use mean_std::{DynamicNetworkSurgeryPruner, MeanStdPruner};

use std::cmp::Ordering;

use ndarray::{Array1, ArrayD};

use crate::error::{OverrideError, OverrideResult};
use crate::ops;
use crate::overrider::StateVariable;
use crate::value::Value;

/// `mean(|x|) + multiplier * std(|x|)`, population standard deviation.
pub(crate) fn mean_std_threshold(values: &ArrayD<f32>, multiplier: f64) -> OverrideResult<f64> {
    if values.is_empty() {
        return Ok(0.0);
    }
    let magnitudes = Value::Array(values.mapv(f32::abs));
    let (mean, variance) = ops::moments(&magnitudes, None, false)?;
    Ok(mean.to_scalar()? + multiplier * variance.to_scalar()?.max(0.0).sqrt())
}

/// Revives the largest-magnitude entry of an otherwise empty mask.
pub(crate) fn keep_at_least_one(mut mask: ArrayD<f32>, values: &ArrayD<f32>) -> ArrayD<f32> {
    if mask.is_empty() || mask.iter().any(|&m| m != 0.0) {
        return mask;
    }
    let largest = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.abs()
                .partial_cmp(&b.abs())
                .unwrap_or(Ordering::Equal)
        })
        .map(|(index, _)| index);
    if let Some(entry) = largest.and_then(|index| mask.iter_mut().nth(index)) {
        *entry = 1.0;
    }
    mask
}

/// Channels whose score reaches the `ceil(density * n)`-th highest, at least
/// one. Ties at the cutoff are all kept.
pub(crate) fn top_channels(scores: &[f64], density: f64) -> OverrideResult<Vec<bool>> {
    let n = scores.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let keep = ((density * n as f64).ceil() as usize).clamp(1, n);
    let scores: Array1<f32> = scores.iter().map(|&s| s as f32).collect();
    let cutoff = ops::top_k(&Value::Array(scores.clone().into_dyn()), keep)?.to_scalar()? as f32;
    Ok(scores.iter().map(|&s| s >= cutoff).collect())
}

pub(crate) fn check_density(kind: &str, density: f64) -> OverrideResult<()> {
    if !(density > 0.0 && density <= 1.0) {
        return Err(OverrideError::config(format!(
            "{kind}: density must be within (0, 1], got {density}"
        )));
    }
    Ok(())
}

pub(crate) fn check_non_negative(kind: &str, field: &str, value: f64) -> OverrideResult<()> {
    if !(value >= 0.0 && value.is_finite()) {
        return Err(OverrideError::config(format!(
            "{kind}: {field} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

pub(crate) fn mask_of<'a>(
    kind: &str,
    mask: &'a Option<StateVariable>,
) -> OverrideResult<&'a StateVariable> {
    mask.as_ref().ok_or_else(|| OverrideError::NotApplied {
        name: kind.to_string(),
    })
}

/// Fraction of mask entries that are set.
pub(crate) fn mask_density(mask: &ArrayD<f32>) -> f64 {
    crate::report::density(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn threshold_combines_mean_and_deviation() {
        let x = array![1.0f32, -3.0].into_dyn();
        assert_abs_diff_eq!(mean_std_threshold(&x, 0.0).unwrap(), 2.0);
        assert_abs_diff_eq!(mean_std_threshold(&x, 2.0).unwrap(), 4.0);
    }

    #[test]
    fn empty_masks_keep_the_largest_entry() {
        let x = array![0.5f32, -2.0, 1.0].into_dyn();
        let mask = keep_at_least_one(ArrayD::zeros(x.raw_dim()), &x);
        assert_eq!(mask, array![0.0f32, 1.0, 0.0].into_dyn());
    }

    #[test]
    fn top_channels_rounds_up_and_never_empties() {
        assert_eq!(top_channels(&[0.1, 3.0, 2.0], 0.5).unwrap(), vec![false, true, true]);
        assert_eq!(top_channels(&[0.1, 3.0, 2.0], 0.01).unwrap(), vec![false, true, false]);
        assert_eq!(top_channels(&[2.0, 2.0, 1.0], 0.34).unwrap(), vec![true, true, false]);
    }
}
