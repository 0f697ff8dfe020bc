//! Agent runtime: drives a provider through preview tool calls.
//!
//! The loop streams one provider turn at a time, runs at most one tool call
//! per turn, appends results to the conversation, and emits
//! [`AgentEvent`]s that [`wire`] turns into response bytes.

use serde::{Deserialize, Serialize};

use animo_core::conversation::Conversation;

pub mod prompt;
pub mod runtime;
pub mod wire;

pub use runtime::{AgentLoop, LoopPolicy, LoopState};
pub use wire::Framing;

/// Events emitted by the agent runtime during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Streaming text delta, forwarded as soon as it arrives.
    #[serde(rename = "partial_reply")]
    PartialReply { delta: String },

    /// A tool call is being made.
    #[serde(rename = "tool_call")]
    ToolCall {
        tool: String,
        params: serde_json::Value,
    },

    /// A tool call has completed.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool: String,
        content: String,
        is_error: bool,
        images: usize,
    },

    /// Token usage reported for the last provider turn.
    #[serde(rename = "usage")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// A terminal error; no more events follow.
    #[serde(rename = "error")]
    Error { kind: AgentErrorKind, message: String },
}

/// Result of a completed agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub final_state: LoopState,
    /// Completed tool round-trips.
    pub iterations: u32,
    pub tool_calls: u32,
    pub aborted: bool,
    pub error: Option<AgentRunError>,
    pub duration_ms: u64,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunError {
    pub kind: AgentErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// Retries exhausted on transient failures.
    ProviderUnavailable,
    /// Non-retryable provider failure (auth, bad request).
    ProviderError,
}
