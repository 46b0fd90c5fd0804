//! Error types for the protection layer.
//!
//! Cache and limiter operations are best-effort and never surface these to
//! business logic; they are used at the edges (configuration, snapshot
//! backends) where a caller can actually act on a failure.

use thiserror::Error;

/// Errors raised by guardrail components.
#[derive(Debug, Error)]
pub enum GuardError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidConfig {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A snapshot backend failed to read or write.
    #[error("snapshot backend error: {0}")]
    Backend(String),
}

/// Convenience alias for results carrying a [`GuardError`].
pub type GuardResult<T> = Result<T, GuardError>;
