//! Error types for diagen-ai

use thiserror::Error;

/// Result type alias using diagen-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to an LLM vendor or estimating tokens
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Vendor name not recognised
    #[error("Vendor not supported: {0}")]
    UnsupportedVendor(String),

    /// Token counting failed
    #[error("Token estimation failed: {0}")]
    TokenEstimation(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Build an error from a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        if status == 429 {
            return Self::RateLimited { retry_after };
        }
        if status == 401 || status == 403 {
            return Self::InvalidApiKey;
        }

        // Both vendors wrap errors as {"error": {"type": ..., "message": ...}}
        let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        let error_type = error
            .and_then(|e| e.get("type"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("http_{}", status));
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.trim().to_string());

        Self::Api {
            error_type,
            message,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || et.starts_with("http_5")
                    || et == "server_error"
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
                    || msg.contains("529")
            }
            _ => false,
        }
    }

    /// Suggested back-off in seconds, when the vendor supplied one
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_typed_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Sse("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_retryable_api_rate_limit_error_type() {
        let e = Error::api("rate_limit_error", "You have exceeded the rate limit");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_api_overloaded_message() {
        let e = Error::api("error", "API is overloaded right now");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_not_retryable_api_auth() {
        let e = Error::api("authentication_error", "Invalid API key");
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_not_retryable_key_or_estimation() {
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::TokenEstimation("too large".into()).is_retryable());
    }

    #[test]
    fn test_from_status_rate_limited() {
        let e = Error::from_status(429, "", Some(12));
        assert!(matches!(e, Error::RateLimited { retry_after: Some(12) }));
        assert_eq!(e.retry_after(), Some(12));
        assert!(e.is_retryable());
    }

    #[test]
    fn test_from_status_parses_vendor_body() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#;
        match Error::from_status(400, body, None) {
            Error::Api {
                error_type,
                message,
            } => {
                assert_eq!(error_type, "invalid_request_error");
                assert_eq!(message, "max_tokens too large");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_status_server_error_is_retryable() {
        let e = Error::from_status(503, "upstream unavailable", None);
        assert!(e.is_retryable());
        assert!(!Error::from_status(400, "bad", None).is_retryable());
    }

    #[test]
    fn test_from_status_auth() {
        assert!(matches!(Error::from_status(401, "", None), Error::InvalidApiKey));
    }
}
