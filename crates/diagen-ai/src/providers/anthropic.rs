//! Anthropic Claude Messages API provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, expected_function, map_sse_error};
use crate::{
    error::{Error, Result},
    stream::{MessageEvent, MessageEventStream, collect_response},
    types::{CompletionRequest, Message, RawModelResponse, Role, Tool, Usage, Vendor},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Tool choice strategy
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    tool_choice: ToolChoice,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: Vendor::Anthropic.default_base_url().to_string(),
            tool_choice: ToolChoice::Auto,
        }
    }

    /// Point the provider at a compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override how strongly the model is pushed towards calling a tool
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    /// Stream a response from Claude
    pub async fn stream(&self, request: &CompletionRequest) -> Result<MessageEventStream> {
        let body = build_request(request, &self.tool_choice);
        let url = format!("{}/v1/messages", self.base_url);

        tracing::debug!(url = %url, model = %request.model, "Anthropic messages request");

        let request_builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "application/json")
            .json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<RawModelResponse> {
        let events = self.stream(request).await?;
        collect_response(events, expected_function(request)).await
    }
}

fn build_request(request: &CompletionRequest, tool_choice: &ToolChoice) -> AnthropicRequest {
    let (system, messages) = convert_messages(&request.messages);
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(convert_tools(&request.tools))
    };
    let has_tools = tools.is_some();

    AnthropicRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        stream: true,
        system,
        temperature: request.temperature,
        tools,
        tool_choice: if has_tools {
            Some(tool_choice.clone())
        } else {
            None
        },
    }
}

/// System messages go to the top-level `system` field; consecutive turns of
/// the same role are merged since the API expects alternating roles.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut result: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system_parts.push(&msg.content);
                continue;
            }
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        // the API rejects empty content blocks
        if msg.content.trim().is_empty() {
            continue;
        }

        match result.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => result.push(AnthropicMessage {
                role: role.to_string(),
                content: msg.content.clone(),
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, result)
}

fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

/// Translate one named SSE event into message events.
fn translate_event(event: &str, data: &str, usage: &mut Usage) -> Vec<MessageEvent> {
    match event {
        "message_start" => {
            if let Ok(data) = serde_json::from_str::<MessageStartEvent>(data) {
                usage.input = data.message.usage.input_tokens;
                usage.output = data.message.usage.output_tokens;
            }
            vec![]
        }
        "content_block_start" => match serde_json::from_str::<ContentBlockStartEvent>(data) {
            Ok(data) if data.content_block.block_type == "tool_use" => {
                vec![MessageEvent::ToolCallStart {
                    index: data.index as usize,
                    id: data.content_block.id.unwrap_or_default(),
                    name: data.content_block.name.unwrap_or_default(),
                }]
            }
            Ok(data) if data.content_block.block_type == "text" => data
                .content_block
                .text
                .filter(|t| !t.is_empty())
                .map(|delta| vec![MessageEvent::TextDelta { delta }])
                .unwrap_or_default(),
            _ => vec![],
        },
        "content_block_delta" => match serde_json::from_str::<ContentBlockDeltaEvent>(data) {
            Ok(data) => match data.delta.delta_type.as_str() {
                "text_delta" => vec![MessageEvent::TextDelta {
                    delta: data.delta.text.unwrap_or_default(),
                }],
                "input_json_delta" => vec![MessageEvent::ToolCallDelta {
                    index: data.index as usize,
                    delta: data.delta.partial_json.unwrap_or_default(),
                }],
                _ => vec![],
            },
            Err(_) => vec![],
        },
        "message_delta" => {
            if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(data) {
                usage.output = data.usage.output_tokens;
            }
            vec![]
        }
        "error" => {
            let error = match serde_json::from_str::<ErrorEvent>(data) {
                Ok(data) => Error::api(data.error.error_type, data.error.message),
                Err(_) => Error::UnexpectedResponse(data.to_string()),
            };
            vec![MessageEvent::Error(error)]
        }
        _ => vec![],
    }
}

/// Create the event stream from SSE events
fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut usage = Usage::default();

        yield MessageEvent::Start;

        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    if message.event == "message_stop" {
                        break;
                    }
                    for event in translate_event(&message.event, &message.data, &mut usage) {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            event_source.close();
                            return;
                        }
                    }
                }
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error(map_sse_error(e).await);
                    return;
                }
            }
        }

        event_source.close();
        yield MessageEvent::Done { usage };
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageStartData,
}

#[derive(Debug, Deserialize)]
struct MessageStartData {
    usage: UsageData,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockData,
}

#[derive(Debug, Deserialize)]
struct ContentBlockData {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaData,
}

#[derive(Debug, Deserialize)]
struct DeltaData {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    usage: UsageData,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorData,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResponseBuilder;

    #[test]
    fn test_system_messages_are_lifted() {
        let (system, messages) = convert_messages(&[
            Message::system("You draw diagrams."),
            Message::user("draw a login flow"),
            Message::assistant("I can't do that"),
            Message::user("Please use the function."),
        ]);
        assert_eq!(system.as_deref(), Some("You draw diagrams."));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn test_consecutive_roles_are_merged() {
        let (system, messages) = convert_messages(&[
            Message::user("first"),
            Message::user("second"),
        ]);
        assert!(system.is_none());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "first\n\nsecond");
    }

    #[test]
    fn test_empty_messages_are_dropped() {
        let (_, messages) = convert_messages(&[
            Message::user("draw a login flow"),
            Message::assistant(""),
            Message::user("Please use the function."),
        ]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert_eq!(
            messages[0].content,
            "draw a login flow\n\nPlease use the function."
        );
    }

    #[test]
    fn test_build_request_sets_tool_choice() {
        let request = CompletionRequest {
            model: "claude-sonnet-4-5-20250929".into(),
            messages: vec![Message::user("hi")],
            max_tokens: 100,
            tools: vec![Tool::new("f", "d", serde_json::json!({"properties": {}}))],
            temperature: None,
        };
        let body = serde_json::to_value(build_request(&request, &ToolChoice::Auto)).unwrap();
        assert_eq!(body["tool_choice"]["type"], "auto");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_tool_use_stream_keeps_raw_json() {
        let sse = [
            ("message_start", r#"{"message":{"usage":{"input_tokens":30,"output_tokens":1}}}"#),
            (
                "content_block_start",
                r#"{"index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"create_mermaid_diagram","input":{}}}"#,
            ),
            (
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"definitionText\": \"graph"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":" TD\"}"}}"#,
            ),
            ("message_delta", r#"{"delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#),
        ];

        let mut usage = Usage::default();
        let mut builder = ResponseBuilder::new();
        for (name, data) in sse {
            for event in translate_event(name, data, &mut usage) {
                builder.process_event(event).unwrap();
            }
        }

        assert_eq!(usage.input, 30);
        assert_eq!(usage.output, 15);
        assert_eq!(
            builder.finish("create_mermaid_diagram"),
            RawModelResponse::call("create_mermaid_diagram", "{\"definitionText\": \"graph TD\"}")
        );
    }

    #[test]
    fn test_error_event_is_retryable_when_overloaded() {
        let events = translate_event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            &mut Usage::default(),
        );
        match &events[..] {
            [MessageEvent::Error(e)] => assert!(e.is_retryable()),
            other => panic!("unexpected events: {:?}", other),
        }
    }
}
