//! Error types for the babelcast pipeline.

/// Top-level error type for the translation fan-out system.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or unusable input (transcript event, audio, text).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// External translation service error.
    #[error("translate error: {0}")]
    Translate(String),

    /// External synthesis service error.
    #[error("synthesize error: {0}")]
    Synthesize(String),

    /// The synthesizer rejected the SSML document itself.
    #[error("invalid SSML: {0}")]
    InvalidSsml(String),

    /// Broadcast transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The listener's connection is gone and must be removed.
    #[error("connection gone: {0}")]
    ConnectionGone(String),

    /// Cache backing-store error (advisory; callers treat as miss).
    #[error("cache error: {0}")]
    Cache(String),

    /// Session-scoped operation against an unknown session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// An external call exceeded its deadline.
    #[error("deadline exceeded after {0:?}")]
    Deadline(std::time::Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the remote end is throttled or briefly unavailable and the
    /// call may be retried within its deadline budget.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Translate(msg) | Self::Synthesize(msg) | Self::Transport(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("throttl")
                    || msg.contains("unavailable")
                    || msg.contains("429")
                    || msg.contains("503")
                    || msg.contains("timed out")
            }
            _ => false,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
