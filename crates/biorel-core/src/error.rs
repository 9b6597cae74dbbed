use thiserror::Error;

/// Errors that can occur during biorel core operations.
#[derive(Debug, Error)]
pub enum BiorelError {
    /// A configuration value is missing, unknown or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An entity type has no registered marker tokens.
    #[error("no marker tokens registered for entity type {entity_type:?}")]
    UnknownMarker {
        /// The entity type that was looked up.
        entity_type: String,
    },

    /// A span does not fit inside its sentence.
    #[error("span ({start}, {end}) is out of bounds for a sentence of {len} tokens")]
    SpanOutOfBounds { start: usize, end: usize, len: usize },

    /// Candidate enumeration and gold supervision disagree in size.
    ///
    /// This is an integrity violation: training on it would silently pair
    /// labels with the wrong candidates.
    #[error(
        "alignment mismatch in sentence {sentence}: {candidates} candidates but {rows} gold rows"
    )]
    AlignmentMismatch {
        sentence: usize,
        candidates: usize,
        rows: usize,
    },

    /// The ensemble was asked about a sub-task it does not own.
    #[error("unknown sub-task: {0}")]
    UnknownSubTask(String),

    /// The encoder weights or tokenizer could not be loaded.
    #[error("failed to load encoder: {0}")]
    EncoderLoad(String),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for biorel core operations.
pub type Result<T> = std::result::Result<T, BiorelError>;
