//! Anthropic Messages API provider.
//!
//! Streams `/v1/messages` and folds `input_json_delta` fragments into one
//! complete tool call per content block.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use animo_core::conversation::ConversationEntry;
use animo_core::types::ContentBlock;

use crate::sse::{SseStream, parse_response};
use crate::{
    ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider,
    ModelApi, ProviderError, ToolChoice, ToolDefinition,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

/// Streaming event types from the Messages API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    message: String,
}

impl ApiError {
    fn into_provider_error(self) -> ProviderError {
        let kind = self.error_type.unwrap_or_default();
        let message = format!("{kind}: {}", self.message);
        match kind.as_str() {
            "overloaded_error" | "rate_limit_error" | "api_error" => ProviderError::Transient(message),
            _ => ProviderError::Fatal(message),
        }
    }
}

#[derive(Debug)]
struct OpenToolUse {
    index: usize,
    id: String,
    name: String,
    input_json: String,
}

struct AnthropicChunkState {
    sse: SseStream,
    tool: Option<OpenToolUse>,
    pending: VecDeque<Result<CompletionChunk, ProviderError>>,
    done: bool,
}

impl AnthropicChunkState {
    fn absorb(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.pending.push_back(Ok(CompletionChunk {
                        usage: Some(ChunkUsage {
                            input_tokens: Some(usage.input_tokens),
                            output_tokens: Some(usage.output_tokens),
                        }),
                        ..CompletionChunk::default()
                    }));
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: StartBlock::ToolUse { id, name },
            } => {
                self.tool = Some(OpenToolUse {
                    index,
                    id,
                    name,
                    input_json: String::new(),
                });
            }
            StreamEvent::ContentBlockStart { .. } => {}
            StreamEvent::ContentBlockDelta { delta, index } => match delta {
                Delta::TextDelta { text } if !text.is_empty() => {
                    self.pending.push_back(Ok(CompletionChunk::text(text)));
                }
                Delta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.tool.as_mut().filter(|t| t.index == index) {
                        tool.input_json.push_str(&partial_json);
                    }
                }
                _ => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if self.tool.as_ref().is_some_and(|t| t.index == index) {
                    if let Some(tool) = self.tool.take() {
                        let input = if tool.input_json.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            tool.input_json
                        };
                        self.pending
                            .push_back(Ok(CompletionChunk::tool_use(tool.id, tool.name, input)));
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.pending.push_back(Ok(CompletionChunk {
                    stop_reason: delta.stop_reason,
                    usage: usage.map(|u| ChunkUsage {
                        input_tokens: None,
                        output_tokens: Some(u.output_tokens),
                    }),
                    ..CompletionChunk::default()
                }));
            }
            StreamEvent::MessageStop => self.done = true,
            StreamEvent::Error { error } => {
                self.pending.push_back(Err(error.into_provider_error()));
                self.done = true;
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
        }
    }
}

/// Turn a Messages API SSE stream into completion chunks.
pub(crate) fn chunk_stream(sse: SseStream) -> ChunkStream {
    let stream = futures::stream::unfold(
        AnthropicChunkState {
            sse,
            tool: None,
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.sse.next().await {
                    Some(Ok(sse_event)) => {
                        match serde_json::from_str::<StreamEvent>(&sse_event.data) {
                            Ok(event) => state.absorb(event),
                            Err(e) => trace!(%e, data = %sse_event.data, "Failed to parse Anthropic event"),
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        if state.tool.is_some() {
                            state.done = true;
                            return Some((
                                Err(ProviderError::Transient(
                                    "stream ended inside a tool_use block".into(),
                                )),
                                state,
                            ));
                        }
                        return None;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

fn format_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { source } if source.source_type == "base64" => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": source.media_type,
                "data": source.data,
            }
        }),
        ContentBlock::Image { source } => json!({
            "type": "image",
            "source": { "type": "url", "url": source.data }
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            // The API only accepts an object here.
            "input": if input.is_object() { input.clone() } else { json!({ "arguments": input }) },
        }),
    }
}

/// Append `content` as a `role` message, merging into the previous message
/// when it has the same role (the API expects alternating turns).
fn push_message(messages: &mut Vec<serde_json::Value>, role: &str, content: Vec<serde_json::Value>) {
    if content.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last["role"] == role {
            if let Some(existing) = last["content"].as_array_mut() {
                existing.extend(content);
                return;
            }
        }
    }
    messages.push(json!({ "role": role, "content": content }));
}

/// Only a declared, forbidden tool set needs an explicit choice.
fn tool_choice(request: &CompletionRequest) -> Option<serde_json::Value> {
    let declared = request.tools.as_ref().is_some_and(|t| !t.is_empty());
    (declared && request.tool_choice == ToolChoice::None).then(|| json!({"type": "none"}))
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn api(&self) -> ModelApi {
        ModelApi::AnthropicMessages
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect()
    }

    fn format_messages(&self, conversation: &[ConversationEntry]) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        for entry in conversation {
            match entry {
                ConversationEntry::User { content, .. } => {
                    push_message(&mut messages, "user", content.iter().map(format_block).collect());
                }
                ConversationEntry::Assistant { content, .. } => {
                    let blocks = content
                        .iter()
                        .filter(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()))
                        .map(format_block)
                        .collect();
                    push_message(&mut messages, "assistant", blocks);
                }
                ConversationEntry::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    ..
                } => {
                    push_message(
                        &mut messages,
                        "user",
                        vec![json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                            "is_error": is_error,
                        })],
                    );
                }
            }
        }
        messages
    }

    fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
        stop_reason == "tool_use"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ChunkStream, ProviderError> {
        let Credentials::ApiKey { api_key } = credentials;

        let body = MessagesRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            system: request.system.clone(),
            temperature: request.temperature,
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            tool_choice: tool_choice(request),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming Anthropic API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        Ok(chunk_stream(parse_response(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::parse_sse_stream;
    use crate::sse::tests::chunks;
    use animo_core::types::ImageSource;

    fn stream_of(parts: &[&str]) -> ChunkStream {
        chunk_stream(Box::pin(parse_sse_stream(chunks(parts))))
    }

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new(Some("http://localhost:9999/"));
        assert_eq!(provider.id(), "anthropic");
        assert_eq!(provider.api(), ModelApi::AnthropicMessages);
        assert_eq!(provider.base_url, "http://localhost:9999");
        assert!(provider.is_tool_use_stop("tool_use"));
        assert!(!provider.is_tool_use_stop("end_turn"));
    }

    #[test]
    fn test_format_tools_input_schema() {
        let provider = AnthropicProvider::new(None);
        let formatted = provider.format_tools(&[ToolDefinition {
            name: "preview".into(),
            description: "d".into(),
            parameters_schema: json!({"type": "object"}),
        }]);
        assert_eq!(formatted[0]["name"], "preview");
        assert_eq!(formatted[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_tool_result_and_images_merge_into_one_user_turn() {
        let provider = AnthropicProvider::new(None);
        let conversation = vec![
            ConversationEntry::user(vec![ContentBlock::Text { text: "circle".into() }]),
            ConversationEntry::assistant(vec![ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "preview".into(),
                input: json!({"code": "x"}),
            }]),
            ConversationEntry::tool_result("toolu_1", "preview", "2 frames", false),
            ConversationEntry::user(vec![
                ContentBlock::Text { text: "Here are the frames".into() },
                ContentBlock::Image { source: ImageSource::base64_png("QUJD") },
            ]),
        ];

        let messages = provider.format_messages(&conversation);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        let last = messages[2]["content"].as_array().unwrap();
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(last.len(), 3);
        assert_eq!(last[0]["type"], "tool_result");
        assert_eq!(last[0]["tool_use_id"], "toolu_1");
        assert_eq!(last[2]["type"], "image");
        assert_eq!(last[2]["source"]["data"], "QUJD");
    }

    #[test]
    fn test_non_object_tool_input_is_wrapped() {
        let provider = AnthropicProvider::new(None);
        let conversation = vec![ConversationEntry::assistant(vec![ContentBlock::ToolUse {
            id: "toolu_1".into(),
            name: "preview".into(),
            input: json!("{\"code\": tru"),
        }])];

        let messages = provider.format_messages(&conversation);
        let input = &messages[0]["content"][0]["input"];
        assert!(input.is_object());
        assert_eq!(input["arguments"], "{\"code\": tru");
    }

    #[tokio::test]
    async fn test_stream_text_then_tool_use() {
        let stream = stream_of(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Previewing\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"preview\",\"input\":{}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"code\\\": \"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"x\\\"}\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":20}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]);
        let chunks: Vec<CompletionChunk> = stream.map(|c| c.unwrap()).collect().await;

        let text: String = chunks.iter().filter_map(|c| c.delta.clone()).collect();
        assert_eq!(text, "Previewing");
        let tool = chunks.iter().find_map(|c| c.tool_use.clone()).unwrap();
        assert_eq!(tool.id, "toolu_1");
        assert_eq!(tool.input_json, r#"{"code": "x"}"#);
        assert!(chunks.iter().any(|c| c.stop_reason.as_deref() == Some("tool_use")));
    }

    #[tokio::test]
    async fn test_overloaded_error_event_is_transient() {
        let mut stream = stream_of(&[
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        ]);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(e) if e.is_transient()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_request_error_event_is_fatal() {
        let mut stream = stream_of(&[
            "data: {\"type\":\"error\",\"error\":{\"type\":\"invalid_request_error\",\"message\":\"bad\"}}\n\n",
        ]);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(e) if !e.is_transient()));
    }
}
