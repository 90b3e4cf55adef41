//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use diagen_ai::Vendor;

/// Configuration for diagen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default vendor (openai, anthropic)
    pub vendor: Option<String>,
    /// Default model
    pub model: Option<String>,
    /// Override the model's context window
    pub max_model_tokens: Option<u32>,
    /// Directory for generated diagrams when no output path is given
    pub output_dir: Option<PathBuf>,
    /// Renderer settings
    pub renderer: RendererConfig,
    /// Retry limits
    pub retries: RetryLimits,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    /// Alternative API endpoints
    pub base_urls: BaseUrls,
}

/// mermaid-cli settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub theme: Option<String>,
    pub background: Option<String>,
    pub puppeteer_config: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

/// Retry limits of the synthesis loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryLimits {
    pub conversation: Option<u32>,
    pub overall: Option<u32>,
    pub parallel: Option<u32>,
}

/// API key configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

/// Endpoint overrides, for proxies and compatible servers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseUrls {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("diagen")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("DIAGEN_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults when it is missing
    /// or unreadable
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the example config to `path` unless a file is already there
    pub fn init_at(path: &Path) -> std::io::Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())?;
        Ok(path.to_path_buf())
    }

    /// Create the config file at the default location if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        Self::init_at(&Self::config_path())
    }

    /// API key for a vendor from the config file. Environment variables are
    /// consulted later by the provider.
    pub fn api_key(&self, vendor: Vendor) -> Option<&str> {
        match vendor {
            Vendor::OpenAI => self.api_keys.openai.as_deref(),
            Vendor::Anthropic => self.api_keys.anthropic.as_deref(),
        }
    }

    /// Endpoint override for a vendor
    pub fn base_url(&self, vendor: Vendor) -> Option<&str> {
        match vendor {
            Vendor::OpenAI => self.base_urls.openai.as_deref(),
            Vendor::Anthropic => self.base_urls.anthropic.as_deref(),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# diagen configuration file
# Place at ~/.config/diagen/config.toml (Linux), ~/Library/Application Support/diagen/config.toml (Mac)
# or %APPDATA%\diagen\config.toml (Windows), or point DIAGEN_CONFIG_PATH at it.

# Default vendor (openai, anthropic)
vendor = "openai"

# Default model
model = "gpt-4o"

# Override the model's context window (tokens)
# max_model_tokens = 8192

# Where diagrams go when --output is not given
# output_dir = "~/diagrams"

[renderer]
# mermaid-cli executable
program = "mmdc"
# Seconds before a render is abandoned
timeout_secs = 30
# theme = "dark"
# background = "transparent"
# puppeteer_config = "/etc/diagen/puppeteer.json"
# extra_args = ["--quiet"]

[retries]
# Turns per conversation
conversation = 4
# Escalation rounds once a conversation runs out of turns
overall = 3
# Fresh conversations per escalation round
parallel = 2

# API keys (optional - can also use environment variables)
# It's recommended to use environment variables instead for security
[api_keys]
# openai = "sk-..."
# anthropic = "sk-ant-..."

[base_urls]
# openai = "https://api.openai.com/v1"
# anthropic = "https://api.anthropic.com"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.vendor.as_deref(), Some("openai"));
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.renderer.program, Some(PathBuf::from("mmdc")));
        assert_eq!(config.renderer.timeout_secs, Some(30));
        assert_eq!(config.retries.conversation, Some(4));
        assert_eq!(config.retries.overall, Some(3));
        assert_eq!(config.retries.parallel, Some(2));
        assert!(config.api_key(Vendor::OpenAI).is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            vendor = "anthropic"
            [api_keys]
            anthropic = "sk-ant-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.api_key(Vendor::Anthropic), Some("sk-ant-test"));
        assert_eq!(config.renderer, RendererConfig::default());
        assert!(config.base_url(Vendor::Anthropic).is_none());
    }

    #[test]
    fn test_init_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::init_at(&path).unwrap();
        let loaded = Config::load_from(&path);
        assert_eq!(loaded, toml::from_str::<Config>(example_config()).unwrap());

        // existing files are left alone
        fs::write(&path, "model = \"gpt-4o-mini\"\n").unwrap();
        Config::init_at(&path).unwrap();
        assert_eq!(Config::load_from(&path).model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_broken_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "vendor = [").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
        assert_eq!(Config::load_from(&dir.path().join("missing.toml")), Config::default());
    }
}
