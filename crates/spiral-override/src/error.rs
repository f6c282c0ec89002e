// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use thiserror::Error;

use crate::value::Domain;

/// Result alias used throughout the override crate.
pub type OverrideResult<T> = Result<T, OverrideError>;

/// Errors that can be emitted by the dispatcher, the graph and the overriders.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OverrideError {
    /// Unrecognised or out-of-range option for an overrider or helper.
    #[error("configuration error: {message}")]
    Configuration { message: String },
    /// The operation needs at least one non-constant operand.
    #[error("{op} does not accept constants as arguments")]
    DomainMismatch { op: &'static str },
    /// The operation has no semantics in the requested domain.
    #[error("{op} is not supported for {domain} values")]
    UnsupportedOperation { op: &'static str, domain: Domain },
    /// Operands cannot be broadcast or combined.
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// Argument is well-typed but outside the accepted range.
    #[error("invalid argument for {op}: {message}")]
    InvalidArgument { op: &'static str, message: String },
    /// Symbolic operands were created by two different graphs.
    #[error("{op} received tensors from different graphs")]
    GraphMismatch { op: &'static str },
    /// Only variables own storage that can be written.
    #[error("tensor #{id} is not a variable and cannot be assigned")]
    NotVariable { id: usize },
    /// `update` or `assign` was invoked before `apply`.
    #[error("overrider '{name}' has not been applied")]
    NotApplied { name: String },
    /// A symbolic overrider is already bound to another parameter.
    #[error("overrider '{name}' is already bound to a different parameter; reset it first")]
    AlreadyBound { name: String },
}

impl OverrideError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        OverrideError::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        OverrideError::InvalidArgument {
            op,
            message: message.into(),
        }
    }

    pub(crate) fn shape(op: &'static str, left: &[usize], right: &[usize]) -> Self {
        OverrideError::ShapeMismatch {
            op,
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}

impl From<serde_json::Error> for OverrideError {
    fn from(err: serde_json::Error) -> Self {
        OverrideError::config(err.to_string())
    }
}
