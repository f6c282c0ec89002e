// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Declarative overrider configuration.
//!
//! ```json
//! { "type": "IncrementalQuantizer", "interval": 0.25,
//!   "quantizer": { "type": "FixedPointQuantizer", "width": 8, "point": 2 } }
//! ```
//!
//! Unknown variants, unknown options and out-of-range values all surface as
//! [`OverrideError::Configuration`].

use serde::{Deserialize, Serialize};

use crate::error::{OverrideError, OverrideResult};
use crate::lra::LowRankApproximation;
use crate::ops::RoundingMode;
use crate::overrider::{ChainOverrider, EmptyOverrider, Overrider, Overriding, Transform};
use crate::prune::{
    DynamicNetworkSurgeryPruner, FilterNorm, FilterPruner, MeanStdPruner, NetworkSlimmer,
};
use crate::quantize::{
    CentroidMode, CourbariauxQuantizer, DGQuantizer, DGTrainableQuantizer, FixedPointQuantizer,
    FloatingPointQuantizer, IncrementalQuantizer, LogQuantizer, MixedQuantizer, Point,
    Recentralizer, SelectionPolicy, ShiftQuantizer,
};

/// `point` of a fixed-point quantizer: an integer bit count or `"trainable"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointConfig {
    Bits(i32),
    Learned(Trainable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trainable {
    Trainable,
}

impl From<PointConfig> for Point {
    fn from(config: PointConfig) -> Self {
        match config {
            PointConfig::Bits(bits) => Point::Fixed(bits),
            PointConfig::Learned(Trainable::Trainable) => Point::Trainable { initial: None },
        }
    }
}

fn default_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_on_factor() -> f64 {
    1.1
}

fn default_off_factor() -> f64 {
    0.9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum OverriderConfig {
    EmptyOverrider,
    ChainOverrider {
        overriders: Vec<OverriderConfig>,
    },
    FixedPointQuantizer {
        width: u32,
        point: PointConfig,
        #[serde(default)]
        stochastic: Option<RoundingMode>,
    },
    FloatingPointQuantizer {
        exponent_width: u32,
        mantissa_width: u32,
        #[serde(default)]
        exponent_bias: Option<i32>,
    },
    ShiftQuantizer {
        width: u32,
        #[serde(default)]
        bias: Option<i32>,
    },
    LogQuantizer {
        width: u32,
        point: i32,
        #[serde(default = "default_base")]
        base: f64,
    },
    CourbariauxQuantizer {
        #[serde(default)]
        stochastic: bool,
        #[serde(default)]
        scale: bool,
    },
    DGQuantizer {
        threshold: f64,
    },
    DGTrainableQuantizer {
        threshold: f64,
    },
    Recentralizer {
        quantizer: Box<OverriderConfig>,
        #[serde(default)]
        mean_quantizer: Option<Box<OverriderConfig>>,
        #[serde(default)]
        mode: CentroidMode,
    },
    IncrementalQuantizer {
        quantizer: Box<OverriderConfig>,
        interval: f64,
        #[serde(default)]
        policy: SelectionPolicy,
        #[serde(default = "default_true")]
        count_zero: bool,
    },
    MixedQuantizer {
        quantizers: Vec<OverriderConfig>,
        #[serde(default)]
        axis: Option<isize>,
        #[serde(default)]
        assignment: Option<Vec<usize>>,
        #[serde(default)]
        reassign: bool,
    },
    MeanStdPruner {
        multiplier: f64,
        #[serde(default)]
        growth: f64,
    },
    DynamicNetworkSurgeryPruner {
        multiplier: f64,
        #[serde(default)]
        growth: f64,
        #[serde(default = "default_on_factor")]
        on_factor: f64,
        #[serde(default = "default_off_factor")]
        off_factor: f64,
    },
    NetworkSlimmer {
        density: f64,
        #[serde(default)]
        axis: Option<isize>,
        #[serde(default)]
        step: f64,
    },
    FilterPruner {
        density: f64,
        #[serde(default)]
        norm: FilterNorm,
        #[serde(default)]
        axis: Option<isize>,
        #[serde(default)]
        step: f64,
    },
    LowRankApproximation {
        rank: usize,
    },
}

impl OverriderConfig {
    pub fn from_json(text: &str) -> OverrideResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: serde_json::Value) -> OverrideResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OverriderConfig::EmptyOverrider => "EmptyOverrider",
            OverriderConfig::ChainOverrider { .. } => "ChainOverrider",
            OverriderConfig::FixedPointQuantizer { .. } => "FixedPointQuantizer",
            OverriderConfig::FloatingPointQuantizer { .. } => "FloatingPointQuantizer",
            OverriderConfig::ShiftQuantizer { .. } => "ShiftQuantizer",
            OverriderConfig::LogQuantizer { .. } => "LogQuantizer",
            OverriderConfig::CourbariauxQuantizer { .. } => "CourbariauxQuantizer",
            OverriderConfig::DGQuantizer { .. } => "DGQuantizer",
            OverriderConfig::DGTrainableQuantizer { .. } => "DGTrainableQuantizer",
            OverriderConfig::Recentralizer { .. } => "Recentralizer",
            OverriderConfig::IncrementalQuantizer { .. } => "IncrementalQuantizer",
            OverriderConfig::MixedQuantizer { .. } => "MixedQuantizer",
            OverriderConfig::MeanStdPruner { .. } => "MeanStdPruner",
            OverriderConfig::DynamicNetworkSurgeryPruner { .. } => "DynamicNetworkSurgeryPruner",
            OverriderConfig::NetworkSlimmer { .. } => "NetworkSlimmer",
            OverriderConfig::FilterPruner { .. } => "FilterPruner",
            OverriderConfig::LowRankApproximation { .. } => "LowRankApproximation",
        }
    }
}

/// Builds the numeric core of a single, non-chain overrider.
pub fn build_transform(config: &OverriderConfig) -> OverrideResult<Box<dyn Transform>> {
    let transform: Box<dyn Transform> = match config {
        OverriderConfig::EmptyOverrider => Box::new(EmptyOverrider),
        OverriderConfig::ChainOverrider { .. } => {
            return Err(OverrideError::config(
                "ChainOverrider can only appear at the top level of a configuration",
            ))
        }
        OverriderConfig::FixedPointQuantizer {
            width,
            point,
            stochastic,
        } => {
            let quantizer = FixedPointQuantizer::new(*width, Point::from(*point))?;
            match stochastic {
                Some(mode) => Box::new(quantizer.with_stochastic(*mode)),
                None => Box::new(quantizer),
            }
        }
        OverriderConfig::FloatingPointQuantizer {
            exponent_width,
            mantissa_width,
            exponent_bias,
        } => Box::new(FloatingPointQuantizer::new(
            *exponent_width,
            *mantissa_width,
            *exponent_bias,
        )?),
        OverriderConfig::ShiftQuantizer { width, bias } => {
            Box::new(ShiftQuantizer::new(*width, *bias)?)
        }
        OverriderConfig::LogQuantizer { width, point, base } => {
            Box::new(LogQuantizer::new(*width, *point, *base)?)
        }
        OverriderConfig::CourbariauxQuantizer { stochastic, scale } => {
            Box::new(CourbariauxQuantizer::new(*stochastic, *scale))
        }
        OverriderConfig::DGQuantizer { threshold } => Box::new(DGQuantizer::new(*threshold)?),
        OverriderConfig::DGTrainableQuantizer { threshold } => {
            Box::new(DGTrainableQuantizer::new(*threshold)?)
        }
        OverriderConfig::Recentralizer {
            quantizer,
            mean_quantizer,
            mode,
        } => {
            let mean_quantizer = match mean_quantizer {
                Some(config) => Some(build_transform(config)?),
                None => None,
            };
            Box::new(Recentralizer::new(
                build_transform(quantizer)?,
                mean_quantizer,
                *mode,
            ))
        }
        OverriderConfig::IncrementalQuantizer {
            quantizer,
            interval,
            policy,
            count_zero,
        } => Box::new(IncrementalQuantizer::new(
            build_transform(quantizer)?,
            *interval,
            *policy,
            *count_zero,
        )?),
        OverriderConfig::MixedQuantizer {
            quantizers,
            axis,
            assignment,
            reassign,
        } => {
            let quantizers = quantizers
                .iter()
                .map(build_transform)
                .collect::<OverrideResult<Vec<_>>>()?;
            Box::new(MixedQuantizer::new(
                quantizers,
                *axis,
                assignment.clone(),
                *reassign,
            )?)
        }
        OverriderConfig::MeanStdPruner { multiplier, growth } => {
            Box::new(MeanStdPruner::new(*multiplier, *growth)?)
        }
        OverriderConfig::DynamicNetworkSurgeryPruner {
            multiplier,
            growth,
            on_factor,
            off_factor,
        } => Box::new(DynamicNetworkSurgeryPruner::with_factors(
            *multiplier,
            *growth,
            *on_factor,
            *off_factor,
        )?),
        OverriderConfig::NetworkSlimmer {
            density,
            axis,
            step,
        } => Box::new(NetworkSlimmer::new(*density, *axis, *step)?),
        OverriderConfig::FilterPruner {
            density,
            norm,
            axis,
            step,
        } => Box::new(FilterPruner::new(*density, *norm, *axis, *step)?),
        OverriderConfig::LowRankApproximation { rank } => {
            Box::new(LowRankApproximation::new(*rank)?)
        }
    };
    Ok(transform)
}

/// Builds a named overrider. A top-level chain names its children
/// `<name>/<index>`; chains cannot nest.
pub fn build_overrider(
    name: &str,
    config: &OverriderConfig,
    seed: Option<u64>,
) -> OverrideResult<Box<dyn Overrider>> {
    if let OverriderConfig::ChainOverrider { overriders } = config {
        let children = overriders
            .iter()
            .enumerate()
            .map(|(index, child)| {
                let child_name = format!("{name}/{index}");
                single(&child_name, child, seed)
            })
            .collect::<OverrideResult<Vec<_>>>()?;
        return Ok(Box::new(ChainOverrider::new(name, children)));
    }
    single(name, config, seed)
}

fn single(
    name: &str,
    config: &OverriderConfig,
    seed: Option<u64>,
) -> OverrideResult<Box<dyn Overrider>> {
    let overriding = Overriding::new(name, build_transform(config)?);
    Ok(Box::new(match seed {
        Some(seed) => overriding.with_seed(seed),
        None => overriding,
    }))
}
