//! LLM vendor implementations

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use crate::{CompletionRequest, Error, RawModelResponse, Result, Vendor};
use async_trait::async_trait;

/// The single "complete chat" capability the synthesis pipeline consumes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Vendor this provider talks to
    fn vendor(&self) -> Vendor;

    /// Run one completion and classify the result
    async fn complete(&self, request: &CompletionRequest) -> Result<RawModelResponse>;
}

/// Get an API key from a provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.trim().is_empty()) {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Build the provider for a vendor.
pub fn for_vendor(
    vendor: Vendor,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<Arc<dyn LlmProvider>> {
    let key = get_api_key(api_key, vendor.api_key_env_var())?;
    let base_url = base_url.unwrap_or(vendor.default_base_url()).to_string();
    Ok(match vendor {
        Vendor::OpenAI => Arc::new(openai::OpenAIProvider::new(key).with_base_url(base_url)),
        Vendor::Anthropic => {
            Arc::new(anthropic::AnthropicProvider::new(key).with_base_url(base_url))
        }
    })
}

/// Name of the function the response should be matched against
pub(crate) fn expected_function(request: &CompletionRequest) -> &str {
    request
        .tools
        .first()
        .map(|t| t.name.as_str())
        .unwrap_or_default()
}

/// Convert an event-source failure into a crate error, reading the body of
/// non-success HTTP responses so vendor error payloads are preserved.
pub(crate) async fn map_sse_error(error: reqwest_eventsource::Error) -> Error {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            Error::from_status(status.as_u16(), &body, retry_after)
        }
        reqwest_eventsource::Error::Transport(e) => Error::Http(e),
        other => Error::Sse(other.to_string()),
    }
}
