use std::path::PathBuf;

use biorel_core::BiorelError;
use thiserror::Error;

/// Failure modes of the training pipeline that callers may want to match on.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// The configuration failed validation.
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    /// A record line could not be decoded.
    #[error("{}:{line}: {message}", path.display())]
    Data {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A record id does not start with any configured corpus prefix.
    #[error("record {id:?} does not belong to any configured corpus")]
    UnknownCorpus { id: String },

    /// A checkpoint does not match the model it is restored into.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error(transparent)]
    Core(#[from] BiorelError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TrainerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TrainerError::InvalidConfig(message.into())
    }
}
