//! diagen - turn a plain-language description into a rendered mermaid diagram

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use diagen_ai::{Vendor, models};
use diagen_synth::{
    DiagramRequest, MermaidCli, MermaidCliConfig, SynthesisConfig, SynthesisEvent, Synthesizer,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use config::Config;

/// diagen - generate mermaid diagrams with an LLM
#[derive(Parser, Debug)]
#[command(name = "diagen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Description of the diagram to draw
    request: Option<String>,

    /// Read the description from a file
    #[arg(short, long, conflicts_with = "request")]
    file: Option<PathBuf>,

    /// Vendor (openai, anthropic)
    #[arg(long)]
    vendor: Option<String>,

    /// Model to use (default: the vendor's first catalog model)
    #[arg(short, long)]
    model: Option<String>,

    /// Context window of the model in tokens
    #[arg(long)]
    max_model_tokens: Option<u32>,

    /// Where to write the SVG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// mermaid-cli executable
    #[arg(long)]
    renderer: Option<PathBuf>,

    /// Renderer timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Turns per conversation
    #[arg(long)]
    conversation_retries: Option<u32>,

    /// Escalation rounds after a conversation fails
    #[arg(long)]
    overall_retries: Option<u32>,

    /// Parallel conversations per escalation round
    #[arg(long)]
    parallel: Option<u32>,

    /// Print progress while the diagram is being generated
    #[arg(long)]
    progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// List known models and exit
    #[arg(long)]
    list_models: bool,
}

/// Everything a run needs, after flags, config file and defaults are merged.
#[derive(Debug)]
struct Settings {
    vendor: Vendor,
    model: String,
    max_model_tokens: u32,
    output: PathBuf,
    renderer: MermaidCliConfig,
    synthesis: SynthesisConfig,
}

fn build_settings(args: &Args, config: &Config) -> anyhow::Result<Settings> {
    let vendor: Vendor = args
        .vendor
        .as_deref()
        .or(config.vendor.as_deref())
        .unwrap_or("openai")
        .parse()?;

    let model = args
        .model
        .clone()
        .or_else(|| config.model.clone())
        .unwrap_or_else(|| models::default_model(vendor).id.to_string());

    let max_model_tokens = args
        .max_model_tokens
        .or(config.max_model_tokens)
        .unwrap_or_else(|| models::context_window(vendor, &model));

    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let name = format!("diagram-{}.svg", chrono::Local::now().format("%Y%m%d-%H%M%S"));
            match &config.output_dir {
                Some(dir) => dir.join(name),
                None => PathBuf::from(name),
            }
        }
    };

    let mut renderer = MermaidCliConfig::default();
    if let Some(program) = args.renderer.clone().or_else(|| config.renderer.program.clone()) {
        renderer.program = program;
    }
    if let Some(secs) = args.timeout.or(config.renderer.timeout_secs) {
        anyhow::ensure!(secs > 0, "renderer timeout must be at least one second");
        renderer.timeout = Duration::from_secs(secs);
    }
    renderer.theme = config.renderer.theme.clone();
    renderer.background = config.renderer.background.clone();
    renderer.puppeteer_config = config.renderer.puppeteer_config.clone();
    renderer.extra_args = config.renderer.extra_args.clone();

    let mut synthesis = SynthesisConfig::default();
    if let Some(n) = args.conversation_retries.or(config.retries.conversation) {
        synthesis.conversation_retries = n;
    }
    if let Some(n) = args.overall_retries.or(config.retries.overall) {
        synthesis.overall_retries = n;
    }
    if let Some(n) = args.parallel.or(config.retries.parallel) {
        synthesis.parallel_attempts = n;
    }

    Ok(Settings {
        vendor,
        model,
        max_model_tokens,
        output,
        renderer,
        synthesis,
    })
}

fn read_request(args: &Args) -> anyhow::Result<String> {
    let text = match (&args.request, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("no diagram description given; pass it as an argument or use --file"),
    };
    anyhow::ensure!(!text.trim().is_empty(), "the diagram description is empty");
    Ok(text)
}

fn list_models() {
    for vendor in Vendor::all() {
        println!("{}:", vendor);
        for model in models::get_models(vendor) {
            println!(
                "  {:<30} {:<20} {:>7} tokens",
                model.id, model.name, model.context_window
            );
        }
    }
}

fn describe(event: &SynthesisEvent) -> Option<String> {
    match event {
        SynthesisEvent::AttemptStart { attempt, round: 0 } => {
            Some(format!("attempt {}: starting", attempt))
        }
        SynthesisEvent::AttemptStart { attempt, round } => {
            Some(format!("attempt {}: starting (round {})", attempt, round))
        }
        SynthesisEvent::TurnFailed {
            attempt,
            turn,
            message,
            ..
        } => Some(format!("attempt {} turn {}: {}", attempt, turn, message)),
        SynthesisEvent::RenderStart { attempt, turn } => {
            Some(format!("attempt {} turn {}: rendering", attempt, turn))
        }
        SynthesisEvent::RoundStart { round, parallel } => Some(format!(
            "escalating: round {} with {} parallel attempts",
            round, parallel
        )),
        _ => None,
    }
}

/// Print progress lines until the synthesis reaches a terminal event. A slow
/// reader that falls behind the channel notes the gap and keeps going.
async fn report_progress(
    mut events: broadcast::Receiver<SynthesisEvent>,
    mut print: impl FnMut(String),
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                print(format!("({} progress events skipped)", skipped));
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Some(line) = describe(&event) {
            print(line);
        }
        if event.is_terminal() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("diagen_ai=debug,diagen_synth=debug,diagen=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        let path = Config::init().context("failed to create config file")?;
        println!("Config file at: {}", path.display());
        return Ok(());
    }

    if args.list_models {
        list_models();
        return Ok(());
    }

    let config = Config::load();
    let settings = build_settings(&args, &config)?;
    let text = read_request(&args)?;

    tracing::debug!(?settings, "resolved settings");

    let provider = diagen_ai::providers::for_vendor(
        settings.vendor,
        config.api_key(settings.vendor),
        config.base_url(settings.vendor),
    )
    .with_context(|| {
        format!(
            "no API key for {}; set {} or add it to {}",
            settings.vendor,
            settings.vendor.api_key_env_var(),
            Config::config_path().display()
        )
    })?;
    let renderer = Arc::new(MermaidCli::new(settings.renderer.clone()));
    let synthesizer = Synthesizer::new(provider, renderer, settings.synthesis.clone());

    if args.progress {
        let events = synthesizer.subscribe();
        tokio::spawn(report_progress(events, |line| eprintln!("{}", line)));
    }

    let result = synthesizer
        .synthesize(DiagramRequest {
            source_text: text,
            vendor: settings.vendor,
            model: settings.model.clone(),
            max_model_tokens: settings.max_model_tokens,
        })
        .await?;

    if let Some(dir) = settings.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    result
        .artifact
        .save_to(&settings.output)
        .await
        .with_context(|| format!("failed to write {}", settings.output.display()))?;

    if let Some(title) = &result.title {
        println!("{}", title);
    }
    println!("Diagram type: {}", result.diagram_type);
    if !result.explanation.is_empty() {
        println!("\n{}\n", result.explanation);
    }
    println!("Saved to {}", settings.output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["diagen"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_without_config() {
        let settings = build_settings(&args(&["draw"]), &Config::default()).unwrap();
        assert_eq!(settings.vendor, Vendor::OpenAI);
        assert_eq!(settings.model, models::default_model(Vendor::OpenAI).id);
        assert_eq!(
            settings.max_model_tokens,
            models::context_window(Vendor::OpenAI, &settings.model)
        );
        assert_eq!(settings.renderer.program, PathBuf::from("mmdc"));
        assert_eq!(settings.synthesis.conversation_retries, 4);
        assert!(settings.output.to_string_lossy().ends_with(".svg"));
    }

    #[test]
    fn test_flags_override_config() {
        let config: Config = toml::from_str(
            r#"
            vendor = "openai"
            model = "gpt-4o-mini"
            [renderer]
            timeout_secs = 60
            theme = "forest"
            [retries]
            parallel = 5
            "#,
        )
        .unwrap();
        let settings = build_settings(
            &args(&[
                "--vendor", "claude", "--model", "claude-3-opus-20240229", "--timeout", "5",
                "--parallel", "1", "-o", "out/d.svg", "draw",
            ]),
            &config,
        )
        .unwrap();

        assert_eq!(settings.vendor, Vendor::Anthropic);
        assert_eq!(settings.model, "claude-3-opus-20240229");
        assert_eq!(settings.max_model_tokens, 200_000);
        assert_eq!(settings.renderer.timeout, Duration::from_secs(5));
        assert_eq!(settings.renderer.theme.as_deref(), Some("forest"));
        assert_eq!(settings.synthesis.parallel_attempts, 1);
        assert_eq!(settings.output, PathBuf::from("out/d.svg"));
    }

    #[test]
    fn test_unknown_vendor_rejected() {
        assert!(build_settings(&args(&["--vendor", "acme", "draw"]), &Config::default()).is_err());
    }

    #[test]
    fn test_request_sources() {
        assert_eq!(read_request(&args(&["draw a flow"])).unwrap(), "draw a flow");
        assert!(read_request(&args(&[])).is_err());
        assert!(read_request(&args(&["   "])).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.txt");
        std::fs::write(&path, "sequence of a checkout").unwrap();
        let path = path.to_string_lossy().into_owned();
        assert_eq!(
            read_request(&args(&["--file", &path])).unwrap(),
            "sequence of a checkout"
        );
    }

    #[tokio::test]
    async fn test_progress_survives_lagging() {
        let (tx, rx) = broadcast::channel(2);
        for round in 1..=4 {
            tx.send(SynthesisEvent::RoundStart { round, parallel: 2 }).unwrap();
        }
        tx.send(SynthesisEvent::Exhausted {
            attempts: 9,
            last_error: "bad syntax".into(),
        })
        .unwrap();

        let mut lines = Vec::new();
        report_progress(rx, |line| lines.push(line)).await;

        assert_eq!(
            lines,
            [
                "(3 progress events skipped)",
                "escalating: round 4 with 2 parallel attempts",
            ]
        );
    }

    #[test]
    fn test_progress_lines() {
        assert_eq!(
            describe(&SynthesisEvent::RoundStart {
                round: 1,
                parallel: 2
            })
            .as_deref(),
            Some("escalating: round 1 with 2 parallel attempts")
        );
        assert!(describe(&SynthesisEvent::TurnStart {
            attempt: 1,
            turn: 1,
            max_tokens: 10
        })
        .is_none());
    }
}
