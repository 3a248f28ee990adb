//! Error types for relingo.
//!
//! Library crates use [`RelingoError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all relingo operations.
#[derive(Debug, thiserror::Error)]
pub enum RelingoError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the transform taxonomy (client setup, publisher).
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Text-transformation service error that escaped classification.
    #[error("transform error: {0}")]
    Transform(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (bad URL, empty language, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline invariant was violated (e.g. chunk counts disagree).
    #[error("invariant violated: {message}")]
    Invariant { message: String },

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RelingoError>;

impl RelingoError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an invariant error from any displayable message.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RelingoError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = RelingoError::invariant("totalChunks disagree: 3 vs 4");
        assert!(err.to_string().starts_with("invariant violated"));
        assert!(err.to_string().contains("3 vs 4"));
    }
}
