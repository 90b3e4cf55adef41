//! Error types for diagen-synth

use std::fmt;

use thiserror::Error;

use crate::sanitize::SanitizeError;

/// Result type alias using diagen-synth Error
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal errors of a synthesis request.
///
/// Everything here ends the request. Failures the conversation loop can
/// recover from are [`TurnFailure`]s instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Token counting failed; never defaulted to zero
    #[error("Token estimation failed: {0}")]
    TokenEstimation(String),

    /// Non-retryable error from the LLM vendor
    #[error(transparent)]
    Ai(diagen_ai::Error),

    /// The renderer executable could not be started
    #[error("Renderer unavailable: {0}")]
    RendererUnavailable(String),

    /// I/O or other failure around the renderer that is not the diagram's fault
    #[error("Unexpected rendering error: {0}")]
    Unexpected(String),

    /// Every conversation and escalation round failed
    #[error(
        "Rendering exhausted after {attempts} attempts over {rounds} escalation rounds \
         ({llm_calls} LLM calls); last failure: {last_error}"
    )]
    RenderingExhausted {
        rounds: u32,
        attempts: u32,
        llm_calls: u32,
        last_error: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<diagen_ai::Error> for Error {
    fn from(error: diagen_ai::Error) -> Self {
        match error {
            diagen_ai::Error::TokenEstimation(message) => Error::TokenEstimation(message),
            other => Error::Ai(other),
        }
    }
}

impl Error {
    /// Check if this error means the synthesis ran out of retries
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::RenderingExhausted { .. })
    }
}

/// A recoverable failure of one conversation turn.
///
/// Each one consumes a single conversation-retry unit.
#[derive(Debug)]
pub enum TurnFailure {
    /// The model answered in prose instead of calling the function
    NonConformingResponse(String),
    /// The function arguments could not be repaired or were empty
    Sanitize(SanitizeError),
    /// The renderer rejected the definition
    RenderFailed(String),
    /// Transient vendor failure (rate limit, overload, transport)
    Vendor {
        message: String,
        retry_after: Option<u64>,
    },
}

impl TurnFailure {
    /// Short machine-friendly label for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            TurnFailure::NonConformingResponse(_) => "non_conforming_response",
            TurnFailure::Sanitize(SanitizeError::EmptyDefinition) => "empty_definition",
            TurnFailure::Sanitize(_) => "sanitization",
            TurnFailure::RenderFailed(_) => "render_failed",
            TurnFailure::Vendor { .. } => "vendor",
        }
    }
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnFailure::NonConformingResponse(text) if text.is_empty() => {
                f.write_str("model returned an empty response")
            }
            TurnFailure::NonConformingResponse(_) => {
                f.write_str("model answered without calling the diagram function")
            }
            TurnFailure::Sanitize(e) => write!(f, "{}", e),
            TurnFailure::RenderFailed(e) => write!(f, "render failed: {}", e),
            TurnFailure::Vendor { message, .. } => write!(f, "vendor error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation_is_not_wrapped_as_ai() {
        let err: Error = diagen_ai::Error::TokenEstimation("too big".into()).into();
        assert!(matches!(err, Error::TokenEstimation(ref m) if m == "too big"));

        let err: Error = diagen_ai::Error::InvalidApiKey.into();
        assert!(matches!(err, Error::Ai(diagen_ai::Error::InvalidApiKey)));
    }

    #[test]
    fn test_exhausted_message_carries_counts() {
        let err = Error::RenderingExhausted {
            rounds: 3,
            attempts: 7,
            llm_calls: 28,
            last_error: "Parse error on line 2".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("7 attempts"));
        assert!(msg.contains("28 LLM calls"));
        assert!(msg.contains("Parse error on line 2"));
        assert!(err.is_exhausted());
    }
}
