//! Token estimation

use crate::error::{Error, Result};
use crate::types::{Tool, Vendor};

/// Estimates how many model tokens a string will consume.
///
/// Implementations must be deterministic for identical `(text, vendor)` pairs.
pub trait TokenEstimator: Send + Sync {
    /// Estimate tokens for `text` under `vendor`'s tokenizer
    fn estimate(&self, text: &str, vendor: Vendor) -> Result<usize>;

    /// Estimate the prompt cost of a set of function definitions
    fn estimate_tools(&self, tools: &[Tool], vendor: Vendor) -> Result<usize> {
        let mut total = 0;
        for tool in tools {
            let serialized = serde_json::to_string(tool)?;
            total += self.estimate(&serialized, vendor)?;
        }
        Ok(total)
    }
}

/// Characters-per-token heuristic, tuned per vendor.
#[derive(Debug, Clone)]
pub struct HeuristicEstimator {
    /// Flat cost added to every non-empty string (role framing)
    pub overhead: usize,
    /// Inputs longer than this many bytes are rejected
    pub max_input_bytes: usize,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self {
            overhead: 4,
            max_input_bytes: 8 * 1024 * 1024,
        }
    }
}

impl HeuristicEstimator {
    /// Average characters per token for a vendor's tokenizer
    pub fn chars_per_token(vendor: Vendor) -> f64 {
        match vendor {
            Vendor::OpenAI => 4.0,
            Vendor::Anthropic => 3.5,
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str, vendor: Vendor) -> Result<usize> {
        if text.len() > self.max_input_bytes {
            return Err(Error::TokenEstimation(format!(
                "input of {} bytes exceeds the {} byte limit",
                text.len(),
                self.max_input_bytes
            )));
        }
        if text.is_empty() {
            return Ok(0);
        }
        let chars = text.chars().count() as f64;
        Ok((chars / Self::chars_per_token(vendor)).ceil() as usize + self.overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        let est = HeuristicEstimator::default();
        assert_eq!(est.estimate("", Vendor::OpenAI).unwrap(), 0);
    }

    #[test]
    fn test_vendor_ratio() {
        let est = HeuristicEstimator {
            overhead: 0,
            ..Default::default()
        };
        let text = "a".repeat(35);
        assert_eq!(est.estimate(&text, Vendor::OpenAI).unwrap(), 9);
        assert_eq!(est.estimate(&text, Vendor::Anthropic).unwrap(), 10);
    }

    #[test]
    fn test_deterministic() {
        let est = HeuristicEstimator::default();
        let a = est.estimate("flowchart TD\nA-->B", Vendor::Anthropic).unwrap();
        let b = est.estimate("flowchart TD\nA-->B", Vendor::Anthropic).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_input_fails() {
        let est = HeuristicEstimator {
            overhead: 0,
            max_input_bytes: 8,
        };
        let err = est.estimate("123456789", Vendor::OpenAI).unwrap_err();
        assert!(matches!(err, Error::TokenEstimation(_)));
    }

    #[test]
    fn test_estimate_tools_sums_definitions() {
        let est = HeuristicEstimator::default();
        let tool = Tool::new("f", "does things", serde_json::json!({"type": "object"}));
        let one = est.estimate_tools(std::slice::from_ref(&tool), Vendor::OpenAI).unwrap();
        let two = est.estimate_tools(&[tool.clone(), tool], Vendor::OpenAI).unwrap();
        assert!(one > 0);
        assert_eq!(two, one * 2);
    }
}
