/// Result alias that carries the custom [`SequencerError`] type.
pub type Result<T> = std::result::Result<T, SequencerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// Tempo must be a finite, strictly positive number of beats per minute.
    #[error("invalid tempo {0} bpm: tempo must be positive")]
    InvalidTempo(f64),
    /// A loop period could not be turned into a positive number of beats.
    #[error("invalid period `{0}`")]
    InvalidPeriodSpec(String),
    /// The definition provider failed to produce a loop set.
    #[error("failed to load loop definitions: {0}")]
    DefinitionLoad(String),
    /// A loop callback returned an error or panicked during a tick.
    #[error("loop `{name}` callback failed: {detail}")]
    CallbackFailure { name: String, detail: String },
    /// The runtime is shutting down and no longer accepts loop changes.
    #[error("sequencer is shutting down")]
    ShutDown,
    /// Free-form message, mostly used for poisoned locks.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl SequencerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn definition_load<T: std::fmt::Display>(detail: T) -> Self {
        Self::DefinitionLoad(detail.to_string())
    }
}

impl From<&str> for SequencerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SequencerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
