//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to support streaming
//! chat completions from one API family (Anthropic Messages, OpenAI Chat Completions).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use animo_core::conversation::ConversationEntry;

pub mod anthropic;
pub mod openai;
pub mod registry;
pub mod sse;

pub use registry::{ProviderEntry, ProviderRegistry};

/// Supported LLM API protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    AnthropicMessages,
    OpenAiCompletions,
}

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
}

/// Provider failure, split by whether retrying the same turn can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network trouble, rate limiting, overload. Retrying may succeed.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Bad request, bad credentials, unknown model. Retrying will not help.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
            // Anthropic "overloaded"
            || status.as_u16() == 529
        {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::Fatal(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Tool declaration sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Whether the model may call the declared tools on this turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Tools stay declared (the history may reference them) but must not be called.
    None,
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// Messages already in the provider's wire shape (see [`LlmProvider::format_messages`]).
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    pub system: Option<String>,
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub tool_use: Option<ToolUseChunk>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input_json: impl Into<String>) -> Self {
        Self {
            tool_use: Some(ToolUseChunk {
                id: id.into(),
                name: name.into(),
                input_json: input_json.into(),
            }),
            ..Self::default()
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseChunk {
    pub id: String,
    pub name: String,
    /// Complete JSON arguments, accumulated across deltas.
    pub input_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, ProviderError>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "anthropic", "openai").
    fn id(&self) -> &str;

    /// API protocol used by this provider.
    fn api(&self) -> ModelApi;

    /// Convert tool declarations to this provider's format.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value>;

    /// Convert conversation entries to this provider's message format.
    fn format_messages(&self, conversation: &[ConversationEntry]) -> Vec<serde_json::Value>;

    /// Whether a stop reason means the model is waiting on a tool result.
    fn is_tool_use_stop(&self, stop_reason: &str) -> bool;

    /// Stream a chat completion.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ChunkStream, ProviderError>;

    /// Unary completion: the full text of one turn.
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<String, ProviderError> {
        let mut stream = self.stream(request, credentials).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(delta) = chunk?.delta {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(ProviderError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(ProviderError::from_status(StatusCode::from_u16(529).unwrap(), "overloaded").is_transient());
        assert!(!ProviderError::from_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!ProviderError::from_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_chunk_constructors() {
        assert_eq!(CompletionChunk::text("hi").delta.as_deref(), Some("hi"));
        let tool = CompletionChunk::tool_use("c1", "preview", "{}").tool_use.unwrap();
        assert_eq!(tool.name, "preview");
        assert_eq!(CompletionChunk::stop("end_turn").stop_reason.as_deref(), Some("end_turn"));
    }
}
