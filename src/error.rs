//! Error type shared by every module of the crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RnnError>;

/// All failure modes of building, running and persisting a recurrent network.
#[derive(Debug, Error)]
pub enum RnnError {
    /// A structural setter was called after [`crate::rnn::Rnn::compile`].
    #[error("model is already compiled, declarations are frozen")]
    AlreadyCompiled,

    /// An operation that needs compiled parameters ran before `compile`.
    #[error("model is not compiled, call compile first")]
    NotCompiled,

    /// A declaration required by `compile` is missing.
    #[error("{0}")]
    MissingDeclaration(&'static str),

    /// The network was finalized and no further models can be attached.
    #[error("network is finalized, no new models can be unrolled")]
    Finalized,

    /// `train` was called without a trainer.
    #[error("no trainer attached, call add_trainer first")]
    NoTrainer,

    /// Validation data was given without a validator.
    #[error("no validator attached, call add_validator first")]
    NoValidator,

    /// `evaluate` was called without an evaluator.
    #[error("no evaluator attached, compile with evaluate or call add_evaluator")]
    NoEvaluator,

    /// `add_evaluator` was called while an evaluator already exists.
    #[error("an evaluator is already attached")]
    EvaluatorExists,

    /// A tensor did not have the expected shape.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Fed data violates the declared dtype or range.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A recurrent state does not match the cell stack.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Inconsistent or unsupported configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Checkpoint decoding or matching failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// No checkpoint could be located in a directory.
    #[error("no checkpoint found in {}", .0.display())]
    NoCheckpoint(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
