//! OpenAI Chat Completions API provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, expected_function, map_sse_error};
use crate::{
    error::{Error, Result},
    stream::{MessageEvent, MessageEventStream, collect_response},
    types::{CompletionRequest, Message, RawModelResponse, Usage, Vendor},
};

/// OpenAI API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: Vendor::OpenAI.default_base_url().to_string(),
        }
    }

    /// Point the provider at a compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Stream a response from OpenAI
    pub async fn stream(&self, request: &CompletionRequest) -> Result<MessageEventStream> {
        let body = build_request(request);
        let url = format!("{}/chat/completions", self.base_url);

        tracing::debug!(url = %url, model = %request.model, "OpenAI chat completion");

        let request_builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAI
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<RawModelResponse> {
        let events = self.stream(request).await?;
        collect_response(events, expected_function(request)).await
    }
}

fn build_request(request: &CompletionRequest) -> OpenAIRequest {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| OpenAITool {
                    tool_type: "function".to_string(),
                    function: OpenAIFunction {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: Some(t.parameters.clone()),
                    },
                })
                .collect(),
        )
    };

    let has_tools = tools.is_some();
    OpenAIRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(convert_message).collect(),
        stream: true,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        tools,
        tool_choice: if has_tools {
            Some(serde_json::json!("auto"))
        } else {
            None
        },
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
    }
}

fn convert_message(msg: &Message) -> OpenAIMessage {
    OpenAIMessage {
        role: msg.role.as_str().to_string(),
        content: msg.content.clone(),
    }
}

/// Translate one streamed chunk into message events.
fn chunk_events(chunk: StreamChunk, usage: &mut Usage) -> Vec<MessageEvent> {
    let mut events = Vec::new();

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(MessageEvent::TextDelta { delta: content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index as usize;
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            if tc.id.is_some() || name.is_some() {
                events.push(MessageEvent::ToolCallStart {
                    index,
                    id: tc.id.unwrap_or_default(),
                    name: name.unwrap_or_default(),
                });
            }
            if let Some(delta) = arguments {
                events.push(MessageEvent::ToolCallDelta { index, delta });
            }
        }
    }

    if let Some(stream_usage) = chunk.usage {
        usage.input = stream_usage.prompt_tokens;
        usage.output = stream_usage.completion_tokens;
    }

    events
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut usage = Usage::default();

        yield MessageEvent::Start;

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    match serde_json::from_str::<StreamChunk>(&msg.data) {
                        Ok(chunk) => {
                            for event in chunk_events(chunk, &mut usage) {
                                yield event;
                            }
                        }
                        Err(e) => {
                            event_source.close();
                            yield MessageEvent::Error(Error::UnexpectedResponse(
                                format!("Failed to parse chunk: {}", e),
                            ));
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

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: i32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResponseBuilder;
    use crate::types::Tool;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![
                Message::system("You draw diagrams."),
                Message::user("draw a login flow"),
            ],
            max_tokens: 2000,
            tools: vec![Tool::new(
                "create_mermaid_diagram",
                "Generate a mermaid diagram",
                serde_json::json!({"type": "object"}),
            )],
            temperature: None,
        }
    }

    #[test]
    fn test_build_request_shape() {
        let body = serde_json::to_value(build_request(&request())).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "draw a login flow");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "create_mermaid_diagram");
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_build_request_without_tools() {
        let mut req = request();
        req.tools.clear();
        let body = serde_json::to_value(build_request(&req)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_chunks_accumulate_raw_arguments() {
        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"create_mermaid_diagram","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"definitionText\": `graph TD"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\nA-->B`}"}}]}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
        ];

        let mut usage = Usage::default();
        let mut builder = ResponseBuilder::new();
        for chunk in chunks {
            let chunk: StreamChunk = serde_json::from_str(chunk).unwrap();
            for event in chunk_events(chunk, &mut usage) {
                builder.process_event(event).unwrap();
            }
        }

        assert_eq!(usage.input, 12);
        assert_eq!(usage.output, 7);
        assert_eq!(
            builder.finish("create_mermaid_diagram"),
            RawModelResponse::call(
                "create_mermaid_diagram",
                "{\"definitionText\": `graph TD\nA-->B`}"
            )
        );
    }

    #[test]
    fn test_text_chunk() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"Sure"}}]}"#).unwrap();
        let events = chunk_events(chunk, &mut Usage::default());
        assert!(matches!(&events[..], [MessageEvent::TextDelta { delta }] if delta == "Sure"));
    }
}
