// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Drivers that attach overriders to a parameter graph and run it batch by
//! batch.

pub mod checkpoint;
pub mod error;
pub mod preprocess;
pub mod session;

pub use checkpoint::{CheckpointLoader, JsonCheckpoint};
pub use error::{SessionError, SessionResult};
pub use preprocess::{Actions, Batch, BatchSource, InMemorySource, Mode, Preprocess};
pub use session::{Session, Task, Test};
