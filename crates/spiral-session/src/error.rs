// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;

use spiral_config::ConfigError;
use spiral_override::OverrideError;
use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session drivers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Preprocessing mode outside train/validate/test.
    #[error("unrecognized preprocessing mode {0:?}")]
    UnknownMode(String),
    /// Invalid combination of session settings.
    #[error("invalid session setup: {0}")]
    Setup(String),
    #[error("batch shape mismatch: expected {expected:?}, got {got:?}")]
    BatchShape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("variable '{0}' is not part of the session graph")]
    UnknownVariable(String),
    #[error("variable '{0}' is already overridden")]
    AlreadyOverridden(String),
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    /// Raised by a task while predicting or evaluating.
    #[error("task failed: {0}")]
    Task(String),
}

impl SessionError {
    pub(crate) fn checkpoint(path: &std::path::Path, message: impl ToString) -> Self {
        SessionError::Checkpoint {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}
