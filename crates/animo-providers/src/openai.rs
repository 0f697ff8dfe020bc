//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via OpenAI's `/v1/chat/completions` API.

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

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_chunk(self) -> CompletionChunk {
        CompletionChunk::tool_use(self.id, self.name, self.arguments)
    }
}

struct OpenAiChunkState {
    sse: SseStream,
    tool_calls: Vec<ToolCallAccumulator>,
    pending: VecDeque<CompletionChunk>,
    done: bool,
}

impl OpenAiChunkState {
    /// Queue every accumulated tool call, then the stop reason if any.
    fn flush_tool_calls(&mut self, stop_reason: Option<String>) {
        for tc in self.tool_calls.drain(..) {
            if !tc.name.is_empty() {
                self.pending.push_back(tc.into_chunk());
            }
        }
        if let Some(reason) = stop_reason {
            self.pending.push_back(CompletionChunk::stop(reason));
        }
    }

    fn absorb(&mut self, chunk: ChatCompletionChunk) {
        // Usage (sent with stream_options.include_usage)
        if let Some(usage) = chunk.usage {
            self.pending.push_back(CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: Some(usage.prompt_tokens),
                    output_tokens: Some(usage.completion_tokens),
                }),
                ..CompletionChunk::default()
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(tc_deltas) = choice.delta.tool_calls {
            for tc in tc_deltas {
                // Ensure accumulator exists for this index
                while self.tool_calls.len() <= tc.index {
                    self.tool_calls.push(ToolCallAccumulator::default());
                }
                let acc = &mut self.tool_calls[tc.index];
                if let Some(id) = tc.id {
                    acc.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        acc.name = name;
                    }
                    if let Some(args) = f.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.pending.push_back(CompletionChunk::text(content));
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.flush_tool_calls(Some(reason));
        }
    }
}

/// Turn an OpenAI SSE stream into completion chunks.
pub(crate) fn chunk_stream(sse: SseStream) -> ChunkStream {
    let stream = futures::stream::unfold(
        OpenAiChunkState {
            sse,
            tool_calls: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }

                match state.sse.next().await {
                    Some(Ok(sse_event)) => {
                        let data = sse_event.data.trim();

                        // OpenAI terminates with "data: [DONE]"
                        if data == "[DONE]" {
                            state.flush_tool_calls(None);
                            state.done = true;
                            continue;
                        }

                        match serde_json::from_str::<ChatCompletionChunk>(data) {
                            Ok(chunk) => state.absorb(chunk),
                            Err(e) => trace!(%e, data, "Failed to parse OpenAI chunk"),
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        state.flush_tool_calls(None);
                        state.done = true;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

fn image_url(block: &ContentBlock) -> Option<serde_json::Value> {
    match block {
        ContentBlock::Image { source } => Some(json!({
            "type": "image_url",
            "image_url": { "url": source.to_url() }
        })),
        _ => None,
    }
}

/// Unparseable arguments are kept as the model's raw text.
fn arguments_text(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Only a declared, forbidden tool set needs an explicit choice.
fn tool_choice(request: &CompletionRequest) -> Option<serde_json::Value> {
    let declared = request.tools.as_ref().is_some_and(|t| !t.is_empty());
    (declared && request.tool_choice == ToolChoice::None).then(|| json!("none"))
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiCompletions
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }

    fn format_messages(&self, conversation: &[ConversationEntry]) -> Vec<serde_json::Value> {
        let mut messages: Vec<serde_json::Value> = Vec::new();

        for entry in conversation {
            match entry {
                ConversationEntry::User { content, .. } => {
                    let has_images = content.iter().any(|b| matches!(b, ContentBlock::Image { .. }));

                    if has_images {
                        // Use array-of-parts format for multimodal
                        let parts: Vec<serde_json::Value> = content
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => {
                                    Some(json!({"type": "text", "text": text}))
                                }
                                other => image_url(other),
                            })
                            .collect();
                        if !parts.is_empty() {
                            messages.push(json!({"role": "user", "content": parts}));
                        }
                    } else {
                        let text = content
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => Some(text.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        if !text.is_empty() {
                            messages.push(json!({ "role": "user", "content": text }));
                        }
                    }
                }
                ConversationEntry::Assistant { content, .. } => {
                    let mut text_parts = Vec::new();
                    let mut tool_calls = Vec::new();

                    for block in content {
                        match block {
                            ContentBlock::Text { text } => text_parts.push(text.clone()),
                            ContentBlock::ToolUse { id, name, input } => {
                                tool_calls.push(json!({
                                    "id": id,
                                    "type": "function",
                                    "function": {
                                        "name": name,
                                        "arguments": arguments_text(input),
                                    }
                                }));
                            }
                            ContentBlock::Image { .. } => {}
                        }
                    }

                    let mut msg = json!({ "role": "assistant" });
                    if !text_parts.is_empty() {
                        msg["content"] = json!(text_parts.join("\n"));
                    }
                    if !tool_calls.is_empty() {
                        msg["tool_calls"] = json!(tool_calls);
                    }
                    if msg.get("content").is_some() || msg.get("tool_calls").is_some() {
                        messages.push(msg);
                    }
                }
                ConversationEntry::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    }));
                }
            }
        }

        messages
    }

    fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
        stop_reason == "tool_calls"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ChunkStream, ProviderError> {
        let Credentials::ApiKey { api_key } = credentials;

        // Build system message if present
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().cloned());

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            tool_choice: tool_choice(request),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI API");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
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
