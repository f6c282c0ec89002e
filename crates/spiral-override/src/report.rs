// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Metrics emitted by one overrider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideReport {
    pub name: String,
    pub kind: String,
    pub entries: BTreeMap<String, f64>,
}

impl OverrideReport {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        entries: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }
}

/// Combined summary across every overrider of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub original_params: usize,
    pub remaining_params: usize,
    pub overriders: Vec<OverrideReport>,
}

impl CompressionReport {
    pub fn new(
        original_params: usize,
        remaining_params: usize,
        overriders: Vec<OverrideReport>,
    ) -> Self {
        Self {
            original_params,
            remaining_params,
            overriders,
        }
    }

    /// Fraction of parameters that survived pruning.
    pub fn density(&self) -> f64 {
        if self.original_params == 0 {
            return 1.0;
        }
        self.remaining_params as f64 / self.original_params as f64
    }
}

/// Builder for report entries.
#[derive(Debug, Default)]
pub(crate) struct Entries(BTreeMap<String, f64>);

impl Entries {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, key: &str, value: f64) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub(crate) fn finish(self) -> BTreeMap<String, f64> {
        self.0
    }
}

/// Fraction of non-zero entries.
pub(crate) fn density(values: &ArrayD<f32>) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values.iter().filter(|&&v| v != 0.0).count() as f64 / values.len() as f64
}

/// Mean squared difference of two equally shaped arrays.
pub(crate) fn mse(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let total: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    total / a.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn density_counts_survivors() {
        let x = array![0.0f32, 1.0, 0.0, -2.0].into_dyn();
        assert_eq!(density(&x), 0.5);
        let summary = CompressionReport::new(8, 2, Vec::new());
        assert_eq!(summary.density(), 0.25);
    }

    #[test]
    fn reports_serialise_to_json() {
        let report = OverrideReport::new(
            "w",
            "MeanStdPruner",
            Entries::new().with("density", 0.5).finish(),
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"density\":0.5"));
    }
}
