//! Diagram rendering through the mermaid CLI

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tempfile::TempPath;

use crate::error::{Error, Result};

static STACK_TRACE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(.*?)\n\s*at ").unwrap());

/// A rendered diagram on disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct RenderedArtifact {
    path: TempPath,
}

impl RenderedArtifact {
    /// Take ownership of a temporary file holding rendered output
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    /// Location of the rendered file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the rendered bytes
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Copy the rendered output to `dest`, leaving the temporary file to be
    /// cleaned up on drop.
    pub async fn save_to(&self, dest: impl AsRef<Path>) -> std::io::Result<u64> {
        tokio::fs::copy(&self.path, dest).await
    }
}

/// Result of one render call
#[derive(Debug)]
pub enum RenderOutcome {
    /// The renderer produced an artifact
    Rendered(RenderedArtifact),
    /// The renderer rejected the definition; the message is meant for the model
    RenderFailed(String),
}

/// Turns a diagram definition into an artifact.
///
/// `Err` is reserved for failures no corrective turn can fix (missing
/// renderer, local I/O); diagram problems are `Ok(RenderFailed)`.
#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, definition: &str) -> Result<RenderOutcome>;
}

/// Options for the `mmdc` executable
#[derive(Debug, Clone)]
pub struct MermaidCliConfig {
    /// Renderer executable
    pub program: PathBuf,
    /// Wall-clock limit for one render; the child is killed when it expires
    pub timeout: Duration,
    /// Mermaid theme (`-t`)
    pub theme: Option<String>,
    /// Background colour (`-b`)
    pub background: Option<String>,
    /// Puppeteer configuration file (`-p`)
    pub puppeteer_config: Option<PathBuf>,
    /// Appended verbatim after the built-in arguments
    pub extra_args: Vec<String>,
}

impl Default for MermaidCliConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mmdc"),
            timeout: Duration::from_secs(30),
            theme: None,
            background: None,
            puppeteer_config: None,
            extra_args: Vec::new(),
        }
    }
}

/// Renders SVG with mermaid-cli
#[derive(Debug, Clone, Default)]
pub struct MermaidCli {
    config: MermaidCliConfig,
}

impl MermaidCli {
    pub fn new(config: MermaidCliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MermaidCliConfig {
        &self.config
    }

    /// Command line for rendering `input` into `output`
    pub fn command_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-o".into(),
            output.as_os_str().to_owned(),
        ];
        if let Some(theme) = &self.config.theme {
            args.push("-t".into());
            args.push(theme.into());
        }
        if let Some(background) = &self.config.background {
            args.push("-b".into());
            args.push(background.into());
        }
        if let Some(puppeteer) = &self.config.puppeteer_config {
            args.push("-p".into());
            args.push(puppeteer.as_os_str().to_owned());
        }
        args.extend(self.config.extra_args.iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl DiagramRenderer for MermaidCli {
    async fn render(&self, definition: &str) -> Result<RenderOutcome> {
        // Dropped on every return path, which deletes the input file.
        let input = tempfile::Builder::new()
            .prefix("diagen-")
            .suffix(".mmd")
            .tempfile()
            .map_err(|e| Error::Unexpected(format!("failed to create input file: {}", e)))?
            .into_temp_path();
        tokio::fs::write(&input, definition)
            .await
            .map_err(|e| Error::Unexpected(format!("failed to write input file: {}", e)))?;

        let output = tempfile::Builder::new()
            .prefix("diagen-")
            .suffix(".svg")
            .tempfile()
            .map_err(|e| Error::Unexpected(format!("failed to reserve output file: {}", e)))?
            .into_temp_path();

        let program = self.config.program.display().to_string();
        tracing::debug!(program = %program, input = %input.display(), "running renderer");

        let child = tokio::process::Command::new(&self.config.program)
            .args(self.command_args(&input, &output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::RendererUnavailable(format!("failed to start {}: {}", program, e))
            })?;

        let result = tokio::time::timeout(self.config.timeout, child.wait_with_output()).await;

        let out = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(Error::Unexpected(format!(
                    "failed to wait for {}: {}",
                    program, e
                )));
            }
            Err(_) => {
                let secs = self.config.timeout.as_secs();
                tracing::error!(program = %program, timeout_secs = secs, "renderer timed out");
                return Ok(RenderOutcome::RenderFailed(format!(
                    "renderer timed out after {}s",
                    secs
                )));
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let message = if !stderr.trim().is_empty() {
                extract_error_message(&stderr)
            } else if !stdout.trim().is_empty() {
                extract_error_message(&stdout)
            } else {
                match out.status.code() {
                    Some(code) => format!("renderer exited with status {}", code),
                    None => "renderer was terminated by a signal".to_string(),
                }
            };
            tracing::error!(program = %program, error = %message, "renderer rejected definition");
            return Ok(RenderOutcome::RenderFailed(message));
        }

        let size = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            return Ok(RenderOutcome::RenderFailed(
                "renderer exited successfully but produced no output".to_string(),
            ));
        }

        tracing::debug!(output = %output.display(), bytes = size, "diagram rendered");
        Ok(RenderOutcome::Rendered(RenderedArtifact::new(output)))
    }
}

/// The diagnostic part of renderer output: everything before the first stack
/// frame line (one starting with `at ` after indentation), trimmed.
pub fn extract_error_message(output: &str) -> String {
    match STACK_TRACE_START.captures(output) {
        Some(caps) => caps[1].trim().to_string(),
        None => output.trim().to_string(),
    }
}
