//! Core types for LLM interactions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported LLM vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAI,
    Anthropic,
}

impl Vendor {
    /// Get a human-readable name for this vendor
    pub fn name(&self) -> &'static str {
        match self {
            Vendor::OpenAI => "OpenAI",
            Vendor::Anthropic => "Anthropic",
        }
    }

    /// Get the environment variable name for this vendor's API key
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            Vendor::OpenAI => "OPENAI_API_KEY",
            Vendor::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Default API base URL
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Vendor::OpenAI => "https://api.openai.com/v1",
            Vendor::Anthropic => "https://api.anthropic.com",
        }
    }

    /// All vendors, in display order
    pub fn all() -> [Vendor; 2] {
        [Vendor::OpenAI, Vendor::Anthropic]
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Vendor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "open_ai" | "gpt" => Ok(Vendor::OpenAI),
            "anthropic" | "claude" => Ok(Vendor::Anthropic),
            other => Err(Error::UnsupportedVendor(other.to_string())),
        }
    }
}

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Get the role as the wire string both vendors use
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a message with an explicit role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl Tool {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A single chat completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Vendor model identifier
    pub model: String,
    /// Conversation, oldest first. System messages may appear anywhere.
    pub messages: Vec<Message>,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Functions the model may call
    pub tools: Vec<Tool>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
}

/// What the model produced for one completion.
///
/// Decided as soon as the vendor response is complete so that everything
/// downstream matches on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawModelResponse {
    /// The model answered in prose instead of calling the function
    PlainText(String),
    /// The model called a function; `arguments` is the verbatim argument text
    StructuredCall { name: String, arguments: String },
}

impl RawModelResponse {
    /// Create a plain text response
    pub fn text(text: impl Into<String>) -> Self {
        Self::PlainText(text.into())
    }

    /// Create a structured call response
    pub fn call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::StructuredCall {
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Check if this is a structured call
    pub fn is_structured_call(&self) -> bool {
        matches!(self, Self::StructuredCall { .. })
    }
}

/// Token usage reported by the vendor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
}
