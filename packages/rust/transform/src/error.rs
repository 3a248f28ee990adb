//! Failure taxonomy of the text-transformation service.

use relingo_shared::FailureKind;

/// Classified failure of a transform or metadata call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// The provider throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The input does not fit the model's context window.
    #[error("context too large: {0}")]
    ContextTooLarge(String),

    /// Timeouts, connection failures, 5xx, empty answers.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The provider rejected the request, or answered with something that
    /// cannot be used. Sending the same request again will not help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransformError {
    /// The retry policy class this failure falls under.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Transient(_) => FailureKind::Transient,
            Self::ContextTooLarge(_) | Self::InvalidRequest(_) => FailureKind::InvalidInput,
        }
    }

    /// Short machine-readable code, as used in logs and failure reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::ContextTooLarge(_) => "context_too_large",
            Self::Transient(_) => "transient",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_onto_retry_policy_classes() {
        assert_eq!(
            TransformError::RateLimited("x".into()).failure_kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            TransformError::Transient("x".into()).failure_kind(),
            FailureKind::Transient
        );
        assert_eq!(
            TransformError::ContextTooLarge("x".into()).failure_kind(),
            FailureKind::InvalidInput
        );
        assert_eq!(
            TransformError::InvalidRequest("x".into()).failure_kind(),
            FailureKind::InvalidInput
        );
    }

    #[test]
    fn display_includes_code_and_detail() {
        let err = TransformError::ContextTooLarge("16385 tokens".into());
        assert_eq!(err.to_string(), "context too large: 16385 tokens");
        assert_eq!(err.code(), "context_too_large");
    }
}
