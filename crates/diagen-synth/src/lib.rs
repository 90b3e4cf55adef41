//! diagen-synth: diagram synthesis with render feedback
//!
//! A [`Synthesizer`] asks a model to call the diagram function, repairs the
//! arguments it gets back, renders the definition and feeds any renderer error
//! into the conversation until a diagram renders or the retry budget runs out.

pub mod buffer;
pub mod error;
pub mod events;
pub mod function;
pub mod render;
pub mod sanitize;
pub mod synthesis;

pub use buffer::{BufferSnapshot, ConversationBuffer};
pub use error::{Error, Result, TurnFailure};
pub use events::SynthesisEvent;
pub use function::{DiagramType, FUNCTION_NAME, diagram_function};
pub use render::{
    DiagramRenderer, MermaidCli, MermaidCliConfig, RenderOutcome, RenderedArtifact,
    extract_error_message,
};
pub use sanitize::{ExtractedDiagram, SanitizeError, sanitize};
pub use synthesis::{
    AttemptStats, DEFAULT_SYSTEM_PROMPT, DiagramRequest, RetryConfig, SynthesisConfig,
    SynthesisResult, Synthesizer,
};
