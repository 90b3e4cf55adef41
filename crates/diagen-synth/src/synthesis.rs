//! The synthesis loop: converse, sanitize, render, correct, escalate.

use std::sync::Arc;
use std::time::Duration;

use diagen_ai::{
    CompletionRequest, HeuristicEstimator, LlmProvider, Message, RawModelResponse, TokenEstimator,
    Tool, Vendor,
};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    buffer::ConversationBuffer,
    error::{Error, Result, TurnFailure},
    events::SynthesisEvent,
    function::{DiagramType, FUNCTION_NAME, diagram_function},
    render::{DiagramRenderer, RenderOutcome, RenderedArtifact},
    sanitize::{ExtractedDiagram, SanitizeError, sanitize},
};

/// Instruction that opens every conversation
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant specialized in writing professional system diagrams.";

/// Back-off between turns after a transient vendor failure
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting at all
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Tuning for a [`Synthesizer`]
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Turns per conversation attempt
    pub conversation_retries: u32,
    /// Escalation rounds after the initial attempt fails
    pub overall_retries: u32,
    /// Concurrent fresh attempts per escalation round
    pub parallel_attempts: u32,
    /// Ceiling for the per-turn completion budget
    pub max_completion_tokens: u32,
    /// System instruction seeded into every conversation
    pub system_prompt: String,
    /// Sampling temperature passed to the model
    pub temperature: Option<f32>,
    /// Back-off for transient vendor failures
    pub retry: RetryConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            conversation_retries: 4,
            overall_retries: 3,
            parallel_attempts: 2,
            max_completion_tokens: 2000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: None,
            retry: RetryConfig::default(),
        }
    }
}

impl SynthesisConfig {
    /// Most LLM calls a single request can make
    pub fn max_llm_calls(&self) -> u32 {
        self.conversation_retries * (1 + self.overall_retries * self.parallel_attempts)
    }

    fn validate(&self) -> Result<()> {
        if self.conversation_retries == 0 {
            return Err(Error::InvalidConfig(
                "conversation_retries must be at least 1".into(),
            ));
        }
        if self.overall_retries > 0 && self.parallel_attempts == 0 {
            return Err(Error::InvalidConfig(
                "parallel_attempts must be at least 1 when overall_retries is set".into(),
            ));
        }
        if self.max_completion_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_completion_tokens must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// What to draw and with which model
#[derive(Debug, Clone)]
pub struct DiagramRequest {
    /// The user's description of the diagram
    pub source_text: String,
    pub vendor: Vendor,
    pub model: String,
    /// Context window of the model, in tokens
    pub max_model_tokens: u32,
}

/// Attempt counters for a finished request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptStats {
    /// Conversation attempts started, including the initial one
    pub attempts: u32,
    /// Escalation rounds started
    pub rounds: u32,
    /// Completions requested from the model
    pub llm_calls: u32,
}

/// A successfully rendered diagram
#[derive(Debug)]
pub struct SynthesisResult {
    pub artifact: RenderedArtifact,
    pub explanation: String,
    pub diagram_type: DiagramType,
    pub title: Option<String>,
    /// The definition that rendered
    pub definition_text: String,
    pub stats: AttemptStats,
}

/// Drives conversations with the model until a definition renders.
pub struct Synthesizer {
    provider: Arc<dyn LlmProvider>,
    renderer: Arc<dyn DiagramRenderer>,
    estimator: Arc<dyn TokenEstimator>,
    config: Arc<SynthesisConfig>,
    event_tx: broadcast::Sender<SynthesisEvent>,
}

impl Synthesizer {
    /// Create a synthesizer using the heuristic token estimator
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        renderer: Arc<dyn DiagramRenderer>,
        config: SynthesisConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            provider,
            renderer,
            estimator: Arc::new(HeuristicEstimator::default()),
            config: Arc::new(config),
            event_tx,
        }
    }

    /// Replace the token estimator
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Subscribe to synthesis events
    pub fn subscribe(&self) -> broadcast::Receiver<SynthesisEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Produce a rendered diagram for `request`.
    ///
    /// Runs one sequential conversation attempt; if it runs out of turns,
    /// escalates through rounds of concurrent fresh attempts. The first
    /// success of a round wins and cancels its siblings.
    pub async fn synthesize(&self, request: DiagramRequest) -> Result<SynthesisResult> {
        self.config.validate()?;

        let function = diagram_function();
        let function_tokens = self
            .estimator
            .estimate_tools(std::slice::from_ref(&function), request.vendor)?;
        let buffer_max = (request.max_model_tokens as usize)
            .saturating_sub(function_tokens)
            .max(1);

        tracing::debug!(
            function_tokens,
            buffer_max,
            model = %request.model,
            vendor = %request.vendor,
            "starting synthesis"
        );

        let ctx = Arc::new(AttemptContext {
            provider: self.provider.clone(),
            renderer: self.renderer.clone(),
            estimator: self.estimator.clone(),
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            request,
            tools: vec![function],
            buffer_max,
        });

        let mut stats = AttemptStats {
            attempts: 1,
            ..Default::default()
        };

        let report = run_attempt(ctx.clone(), 1, 0, CancellationToken::new()).await?;
        stats.llm_calls += report.llm_calls;
        let mut last_error = match report.outcome {
            AttemptOutcome::Rendered(rendered) => return Ok(self.finish(1, *rendered, stats)),
            AttemptOutcome::Failed(e) => e,
            AttemptOutcome::Cancelled => "attempt cancelled".to_string(),
        };

        for round in 1..=self.config.overall_retries {
            stats.rounds = round;
            tracing::info!(
                round,
                parallel = self.config.parallel_attempts,
                last_error = %last_error,
                "escalating to parallel attempts"
            );
            self.emit(SynthesisEvent::RoundStart {
                round,
                parallel: self.config.parallel_attempts,
            });

            let cancel = CancellationToken::new();
            let mut attempts = JoinSet::new();
            for _ in 0..self.config.parallel_attempts {
                stats.attempts += 1;
                let attempt = stats.attempts;
                let token = cancel.child_token();
                let ctx = ctx.clone();
                attempts.spawn(async move { (attempt, run_attempt(ctx, attempt, round, token).await) });
            }

            let mut winner: Option<(u32, RenderedDiagram)> = None;
            let mut fatal: Option<Error> = None;

            while let Some(joined) = attempts.join_next().await {
                let (attempt, report) = match joined {
                    Ok(r) => r,
                    Err(e) if e.is_panic() => {
                        tracing::error!(round, "attempt task panicked: {}", e);
                        (0, Err(Error::Unexpected(format!("attempt task panicked: {}", e))))
                    }
                    Err(e) => {
                        tracing::debug!(round, "attempt task aborted: {}", e);
                        continue;
                    }
                };
                match report {
                    Ok(report) => {
                        stats.llm_calls += report.llm_calls;
                        match report.outcome {
                            AttemptOutcome::Rendered(rendered) if winner.is_none() && fatal.is_none() => {
                                cancel.cancel();
                                winner = Some((attempt, *rendered));
                            }
                            // a later success is discarded; its artifact is deleted on drop
                            AttemptOutcome::Rendered(_) => {}
                            AttemptOutcome::Failed(e) => last_error = e,
                            AttemptOutcome::Cancelled => {}
                        }
                    }
                    Err(e) => {
                        if winner.is_none() && fatal.is_none() {
                            cancel.cancel();
                            fatal = Some(e);
                        }
                    }
                }
            }

            if let Some((attempt, rendered)) = winner {
                return Ok(self.finish(attempt, rendered, stats));
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }

        tracing::error!(
            attempts = stats.attempts,
            llm_calls = stats.llm_calls,
            last_error = %last_error,
            "diagram synthesis exhausted"
        );
        self.emit(SynthesisEvent::Exhausted {
            attempts: stats.attempts,
            last_error: last_error.clone(),
        });
        Err(Error::RenderingExhausted {
            rounds: stats.rounds,
            attempts: stats.attempts,
            llm_calls: stats.llm_calls,
            last_error,
        })
    }

    fn finish(&self, attempt: u32, rendered: RenderedDiagram, stats: AttemptStats) -> SynthesisResult {
        let RenderedDiagram { diagram, artifact } = rendered;
        tracing::info!(
            attempt,
            diagram_type = %diagram.diagram_type,
            llm_calls = stats.llm_calls,
            "diagram rendered"
        );
        self.emit(SynthesisEvent::Succeeded {
            attempt,
            diagram_type: diagram.diagram_type,
        });
        SynthesisResult {
            artifact,
            explanation: diagram.explanation,
            diagram_type: diagram.diagram_type,
            title: diagram.title,
            definition_text: diagram.definition_text,
            stats,
        }
    }

    fn emit(&self, event: SynthesisEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Everything an attempt needs; shared read-only between concurrent attempts.
struct AttemptContext {
    provider: Arc<dyn LlmProvider>,
    renderer: Arc<dyn DiagramRenderer>,
    estimator: Arc<dyn TokenEstimator>,
    config: Arc<SynthesisConfig>,
    event_tx: broadcast::Sender<SynthesisEvent>,
    request: DiagramRequest,
    tools: Vec<Tool>,
    buffer_max: usize,
}

impl AttemptContext {
    fn emit(&self, event: SynthesisEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[derive(Debug)]
struct RenderedDiagram {
    diagram: ExtractedDiagram,
    artifact: RenderedArtifact,
}

#[derive(Debug)]
enum AttemptOutcome {
    Rendered(Box<RenderedDiagram>),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct AttemptReport {
    outcome: AttemptOutcome,
    llm_calls: u32,
}

enum TurnResult {
    Rendered(RenderedDiagram),
    Failed(TurnFailure),
    Cancelled,
}

async fn run_attempt(
    ctx: Arc<AttemptContext>,
    attempt: u32,
    round: u32,
    cancel: CancellationToken,
) -> Result<AttemptReport> {
    let span = tracing::info_span!("attempt", attempt, round);
    conversation(ctx, attempt, round, cancel).instrument(span).await
}

async fn conversation(
    ctx: Arc<AttemptContext>,
    attempt: u32,
    round: u32,
    cancel: CancellationToken,
) -> Result<AttemptReport> {
    ctx.emit(SynthesisEvent::AttemptStart { attempt, round });

    let mut buffer =
        ConversationBuffer::new(ctx.buffer_max, ctx.estimator.clone(), ctx.request.vendor)?;
    buffer.append(Message::system(ctx.config.system_prompt.as_str()))?;
    buffer.append(Message::user(ctx.request.source_text.as_str()))?;

    let mut llm_calls = 0;
    let mut vendor_failures = 0;
    let mut backoff: Option<Duration> = None;
    let mut last_error = String::from("no turns were run");

    for turn in 1..=ctx.config.conversation_retries {
        if cancel.is_cancelled() {
            return Ok(cancelled(&ctx, attempt, llm_calls));
        }

        if let Some(delay) = backoff.take() {
            tracing::debug!(turn, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(cancelled(&ctx, attempt, llm_calls)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        llm_calls += 1;
        let result = run_turn(&ctx, &mut buffer, attempt, turn, &cancel).await?;

        let failure = match result {
            TurnResult::Rendered(rendered) => {
                ctx.emit(SynthesisEvent::AttemptEnd {
                    attempt,
                    succeeded: true,
                    llm_calls,
                });
                return Ok(AttemptReport {
                    outcome: AttemptOutcome::Rendered(Box::new(rendered)),
                    llm_calls,
                });
            }
            TurnResult::Cancelled => return Ok(cancelled(&ctx, attempt, llm_calls)),
            TurnResult::Failed(failure) => failure,
        };

        if let TurnFailure::Vendor { retry_after, .. } = &failure {
            let retry = &ctx.config.retry;
            let delay = match retry_after {
                Some(secs) => Duration::from_secs(*secs).min(retry.max_delay),
                None => retry.delay_for_attempt(vendor_failures),
            };
            backoff = Some(delay);
            vendor_failures += 1;
        } else {
            vendor_failures = 0;
        }

        tracing::warn!(turn, kind = failure.kind(), "turn failed: {}", failure);
        ctx.emit(SynthesisEvent::TurnFailed {
            attempt,
            turn,
            kind: failure.kind().to_string(),
            message: failure.to_string(),
        });
        last_error = failure.to_string();
    }

    ctx.emit(SynthesisEvent::AttemptEnd {
        attempt,
        succeeded: false,
        llm_calls,
    });
    Ok(AttemptReport {
        outcome: AttemptOutcome::Failed(last_error),
        llm_calls,
    })
}

fn cancelled(ctx: &AttemptContext, attempt: u32, llm_calls: u32) -> AttemptReport {
    tracing::debug!("attempt cancelled");
    ctx.emit(SynthesisEvent::AttemptEnd {
        attempt,
        succeeded: false,
        llm_calls,
    });
    AttemptReport {
        outcome: AttemptOutcome::Cancelled,
        llm_calls,
    }
}

/// One model call and, when it yields a definition, one render.
async fn run_turn(
    ctx: &AttemptContext,
    buffer: &mut ConversationBuffer,
    attempt: u32,
    turn: u32,
    cancel: &CancellationToken,
) -> Result<TurnResult> {
    let max_tokens = completion_budget(buffer, ctx.config.max_completion_tokens);
    tracing::debug!(
        turn,
        max_tokens,
        buffer_tokens = buffer.current_tokens(),
        messages = buffer.len(),
        "requesting completion"
    );
    ctx.emit(SynthesisEvent::TurnStart {
        attempt,
        turn,
        max_tokens,
    });

    let request = CompletionRequest {
        model: ctx.request.model.clone(),
        messages: buffer.messages(),
        max_tokens,
        tools: ctx.tools.clone(),
        temperature: ctx.config.temperature,
    };

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(TurnResult::Cancelled),
        response = ctx.provider.complete(&request) => response,
    };

    let arguments = match response {
        Ok(RawModelResponse::StructuredCall { arguments, .. }) => arguments,
        Ok(RawModelResponse::PlainText(text)) => {
            if !text.trim().is_empty() {
                buffer.append(Message::assistant(text.as_str()))?;
            }
            buffer.append(Message::user(use_function_prompt()))?;
            return Ok(TurnResult::Failed(TurnFailure::NonConformingResponse(text)));
        }
        Err(e) if e.is_retryable() => {
            return Ok(TurnResult::Failed(TurnFailure::Vendor {
                message: e.to_string(),
                retry_after: e.retry_after(),
            }));
        }
        Err(e) => return Err(e.into()),
    };

    let diagram = match sanitize(&arguments) {
        Ok(diagram) => diagram,
        Err(e) => {
            if !arguments.trim().is_empty() {
                buffer.append(Message::assistant(arguments))?;
            }
            buffer.append(Message::user(sanitize_correction(&e)))?;
            return Ok(TurnResult::Failed(TurnFailure::Sanitize(e)));
        }
    };

    tracing::info!(
        turn,
        diagram_type = %diagram.diagram_type,
        "rendering definition"
    );
    ctx.emit(SynthesisEvent::RenderStart { attempt, turn });

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(TurnResult::Cancelled),
        outcome = ctx.renderer.render(&diagram.definition_text) => outcome?,
    };

    match outcome {
        RenderOutcome::Rendered(artifact) => Ok(TurnResult::Rendered(RenderedDiagram {
            diagram,
            artifact,
        })),
        RenderOutcome::RenderFailed(error) => {
            buffer.append(Message::assistant(diagram.definition_text.as_str()))?;
            buffer.append(Message::user(render_correction(&error)))?;
            Ok(TurnResult::Failed(TurnFailure::RenderFailed(error)))
        }
    }
}

/// Per-turn output cap: what is left of the buffer budget, at least one
/// token and never more than `ceiling`.
fn completion_budget(buffer: &ConversationBuffer, ceiling: u32) -> u32 {
    let remaining = buffer.remaining_tokens().max(1);
    remaining.min(ceiling as usize) as u32
}

fn use_function_prompt() -> String {
    format!(
        "Sorry, I need the diagram as a call to the {} function. \
         Could you try the function again?",
        FUNCTION_NAME
    )
}

fn sanitize_correction(error: &SanitizeError) -> String {
    match error {
        SanitizeError::EmptyDefinition => {
            "Sorry but that definition was empty or did not start with a mermaid \
             diagram declaration, could you try the function again?"
                .to_string()
        }
        SanitizeError::Sanitization { message, .. } => format!(
            "Sorry but those function arguments could not be read, could you fix \
             this problem and try the function again:\n```\n{}\n```",
            message
        ),
    }
}

/// The renderer's error goes in verbatim so the model can act on it.
fn render_correction(error: &str) -> String {
    format!(
        "Sorry but that definition did not work, maybe there was a syntax mistake, \
         could you take a look at this error and try the function again:\n```\n{}\n```",
        error
    )
}
