// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-level configuration shared by the override and session crates:
//! random-stream seeding, tracing bootstrap and the system settings file.

pub mod determinism;
pub mod system;
pub mod tracing;

pub use system::{CheckpointConfig, ConfigError, PreprocessConfig, SystemConfig};
