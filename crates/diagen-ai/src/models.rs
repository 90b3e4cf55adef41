//! Model catalog: known models per vendor and their context windows.

use serde::Serialize;

use crate::Vendor;

/// Context window assumed for model ids the catalog does not know.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

/// Model definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    /// Model identifier (e.g., "gpt-4o")
    pub id: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Vendor serving the model
    pub vendor: Vendor,
    /// Context window size in tokens
    pub context_window: u32,
}

const MODELS: &[Model] = &[
    Model {
        id: "gpt-4o",
        name: "GPT-4o",
        vendor: Vendor::OpenAI,
        context_window: 128_000,
    },
    Model {
        id: "gpt-4o-mini",
        name: "GPT-4o mini",
        vendor: Vendor::OpenAI,
        context_window: 128_000,
    },
    Model {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        vendor: Vendor::OpenAI,
        context_window: 128_000,
    },
    Model {
        id: "gpt-4",
        name: "GPT-4",
        vendor: Vendor::OpenAI,
        context_window: 8_192,
    },
    Model {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5 Turbo",
        vendor: Vendor::OpenAI,
        context_window: 16_385,
    },
    Model {
        id: "claude-sonnet-4-5-20250929",
        name: "Claude Sonnet 4.5",
        vendor: Vendor::Anthropic,
        context_window: 200_000,
    },
    Model {
        id: "claude-3-5-haiku-20241022",
        name: "Claude 3.5 Haiku",
        vendor: Vendor::Anthropic,
        context_window: 200_000,
    },
    Model {
        id: "claude-3-opus-20240229",
        name: "Claude 3 Opus",
        vendor: Vendor::Anthropic,
        context_window: 200_000,
    },
];

/// Look up a model by vendor and ID.
pub fn get_model(vendor: Vendor, id: &str) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.vendor == vendor && m.id == id)
}

/// Get all models for a specific vendor.
pub fn get_models(vendor: Vendor) -> Vec<&'static Model> {
    MODELS.iter().filter(|m| m.vendor == vendor).collect()
}

/// The first catalog model for a vendor.
pub fn default_model(vendor: Vendor) -> &'static Model {
    // every vendor has at least one catalog entry
    MODELS
        .iter()
        .find(|m| m.vendor == vendor)
        .unwrap_or(&MODELS[0])
}

/// Context window for a model, falling back to [`DEFAULT_CONTEXT_WINDOW`].
pub fn context_window(vendor: Vendor, id: &str) -> u32 {
    get_model(vendor, id)
        .map(|m| m.context_window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}
