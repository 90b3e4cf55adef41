//! Streaming event types and response accumulation

use crate::error::{Error, Result};
use crate::types::{RawModelResponse, Usage};
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a completion streams in
#[derive(Debug)]
pub enum MessageEvent {
    /// Response started
    Start,
    /// Assistant text delta
    TextDelta { delta: String },
    /// Tool call started
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// Tool call arguments delta (raw, possibly malformed, JSON text)
    ToolCallDelta { index: usize, delta: String },
    /// Response completed successfully
    Done { usage: Usage },
    /// Error occurred; terminal
    Error(Error),
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error(_))
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streaming events into a [`RawModelResponse`].
///
/// Tool call arguments are kept verbatim; nothing is parsed here.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    text: String,
    tool_calls: Vec<ToolCallBuffer>,
    usage: Usage,
    done: bool,
}

impl ResponseBuilder {
    /// Create a new response builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming event. Returns the error carried by an `Error` event.
    pub fn process_event(&mut self, event: MessageEvent) -> Result<()> {
        match event {
            MessageEvent::Start => {}
            MessageEvent::TextDelta { delta } => self.text.push_str(&delta),
            MessageEvent::ToolCallStart { index, id, name } => {
                let call = self.slot(index);
                if !id.is_empty() {
                    call.id = id;
                }
                if !name.is_empty() {
                    call.name = name;
                }
            }
            MessageEvent::ToolCallDelta { index, delta } => {
                self.slot(index).arguments.push_str(&delta);
            }
            MessageEvent::Done { usage } => {
                self.usage = usage;
                self.done = true;
            }
            MessageEvent::Error(e) => return Err(e),
        }
        Ok(())
    }

    /// Token usage reported so far
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Whether a `Done` event was seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Classify the accumulated response.
    ///
    /// A call to `function` wins over any text. Calls to other functions and
    /// empty responses fall back to (possibly empty) plain text.
    pub fn finish(self, function: &str) -> RawModelResponse {
        if let Some(call) = self.tool_calls.into_iter().find(|c| c.name == function) {
            return RawModelResponse::StructuredCall {
                name: call.name,
                arguments: call.arguments,
            };
        }
        RawModelResponse::PlainText(self.text.trim().to_string())
    }

    fn slot(&mut self, index: usize) -> &mut ToolCallBuffer {
        while self.tool_calls.len() <= index {
            self.tool_calls.push(ToolCallBuffer::default());
        }
        &mut self.tool_calls[index]
    }
}

/// Drain a stream into a classified response.
pub async fn collect_response(
    mut events: MessageEventStream,
    function: &str,
) -> Result<RawModelResponse> {
    let mut builder = ResponseBuilder::new();
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        builder.process_event(event)?;
        if terminal {
            break;
        }
    }
    tracing::debug!(
        input_tokens = builder.usage().input,
        output_tokens = builder.usage().output,
        done = builder.is_done(),
        "completion finished"
    );
    Ok(builder.finish(function))
}
