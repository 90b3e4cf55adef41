//! Synthesis event types

use serde::{Deserialize, Serialize};

use crate::function::DiagramType;

/// Events emitted while a diagram is being synthesized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SynthesisEvent {
    /// A conversation attempt started. Round 0 is the initial attempt.
    AttemptStart { attempt: u32, round: u32 },

    /// A turn of an attempt is about to call the model
    TurnStart {
        attempt: u32,
        turn: u32,
        max_tokens: u32,
    },

    /// A turn failed in a way the conversation can recover from
    TurnFailed {
        attempt: u32,
        turn: u32,
        kind: String,
        message: String,
    },

    /// A definition was handed to the renderer
    RenderStart { attempt: u32, turn: u32 },

    /// An attempt finished
    AttemptEnd {
        attempt: u32,
        succeeded: bool,
        llm_calls: u32,
    },

    /// An escalation round of parallel attempts started
    RoundStart { round: u32, parallel: u32 },

    /// A diagram was rendered
    Succeeded {
        attempt: u32,
        diagram_type: DiagramType,
    },

    /// All rounds failed
    Exhausted { attempts: u32, last_error: String },
}

impl SynthesisEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SynthesisEvent::Succeeded { .. } | SynthesisEvent::Exhausted { .. }
        )
    }
}
