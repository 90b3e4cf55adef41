//! diagen-ai: Vendor-neutral chat completion layer
//!
//! This crate provides the message types, the `LlmProvider` capability and
//! streaming OpenAI / Anthropic implementations used by the diagram
//! synthesis pipeline, along with token estimation.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod tokens;
pub mod types;

pub use error::{Error, Result};
pub use providers::LlmProvider;
pub use stream::{MessageEventStream, ResponseBuilder};
pub use tokens::{HeuristicEstimator, TokenEstimator};
pub use types::*;
