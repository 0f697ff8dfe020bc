//! Agent loop controller: provider turns alternating with tool execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use animo_core::config::Config;
use animo_core::conversation::{Conversation, ConversationEntry};
use animo_core::error::AnimoError;
use animo_core::types::{ContentBlock, ImageSource};
use animo_providers::{
    ChunkUsage, CompletionRequest, Credentials, LlmProvider, ProviderError, ToolChoice,
    ToolUseChunk,
};
use animo_tools::{ToolContext, ToolOutput, ToolRegistry};

use crate::prompt::PREVIEW_FRAMES_INSTRUCTION;
use crate::{AgentErrorKind, AgentEvent, AgentRunError, AgentRunResult};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingProviderTurn,
    AwaitingToolExecution,
    Done,
}

/// Limits and request parameters for one run.
#[derive(Debug, Clone)]
pub struct LoopPolicy {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Tool round-trips allowed before the provider is told not to call tools.
    pub max_iterations: u32,
    /// Retries of a single turn after transient failures.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl LoopPolicy {
    pub fn from_config(config: &Config, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            max_iterations: config.max_tool_iterations(),
            max_retries: config.max_retries(),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms()),
        }
    }
}

/// One agent run's collaborators. Built per request.
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    tools: Arc<ToolRegistry>,
    context: ToolContext,
    policy: LoopPolicy,
    system_prompt: Option<String>,
}

/// Outcome of one successful provider turn.
#[derive(Debug, Default)]
struct ProviderTurn {
    text: String,
    tool_call: Option<ToolUseChunk>,
    extra_tool_calls: usize,
    stop_reason: Option<String>,
    usage: ChunkUsage,
}

enum TurnFailure {
    Provider(ProviderError),
    Aborted,
}

/// Forwards streamed text so a retried turn never repeats what the client
/// already received.
///
/// Text already sent stands. A retry only contributes what it produces past
/// the sent length, starting at its first char boundary at or after that
/// length, whether or not its earlier text matches.
struct TurnForwarder<'a> {
    events: &'a mpsc::UnboundedSender<AgentEvent>,
    /// Bytes the client has received across all attempts.
    forwarded_len: usize,
    /// Bytes of the current attempt's text already accounted for.
    cursor: usize,
}

impl<'a> TurnForwarder<'a> {
    fn new(events: &'a mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            events,
            forwarded_len: 0,
            cursor: 0,
        }
    }

    fn begin_attempt(&mut self) {
        self.cursor = self.forwarded_len;
    }

    /// Send the part of `attempt_text` beyond what was already forwarded.
    fn forward(&mut self, attempt_text: &str) {
        if attempt_text.len() <= self.cursor {
            return;
        }
        // The end of the text is always a boundary.
        let start = (self.cursor..=attempt_text.len())
            .find(|&i| attempt_text.is_char_boundary(i))
            .unwrap_or(attempt_text.len());
        self.cursor = attempt_text.len();
        if start == attempt_text.len() {
            return;
        }
        let delta = &attempt_text[start..];
        self.forwarded_len += delta.len();
        let _ = self.events.send(AgentEvent::PartialReply {
            delta: delta.to_string(),
        });
    }
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        tools: Arc<ToolRegistry>,
        context: ToolContext,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            provider,
            credentials,
            tools,
            context,
            policy,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Drive the conversation until the model answers without a tool call,
    /// the provider fails, or the run is cancelled.
    pub async fn run(
        &self,
        mut conversation: Conversation,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> AgentRunResult {
        let start = Instant::now();
        let mut state = LoopState::AwaitingProviderTurn;
        let mut pending: Option<ToolUseChunk> = None;
        let mut iterations = 0u32;
        let mut tool_calls = 0u32;
        let mut aborted = false;
        let mut error = None;

        while state != LoopState::Done {
            if self.context.cancel.is_cancelled() || events.is_closed() {
                info!(?state, "Agent run aborted");
                aborted = true;
                break;
            }

            state = match state {
                LoopState::AwaitingProviderTurn => {
                    let tools_allowed = iterations < self.policy.max_iterations;
                    debug!(iterations, tools_allowed, "Requesting provider turn");

                    match self.provider_turn(&conversation, tools_allowed, &events).await {
                        Ok(turn) => {
                            if let Some(usage) = turn_usage_event(&turn.usage) {
                                let _ = events.send(usage);
                            }
                            let call = self.accept_tool_call(&turn, tools_allowed);

                            let mut content = Vec::new();
                            if !turn.text.is_empty() {
                                content.push(ContentBlock::Text { text: turn.text });
                            }
                            if let Some(call) = &call {
                                content.push(ContentBlock::ToolUse {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    input: recorded_input(&call.name, &call.input_json),
                                });
                            }
                            if !content.is_empty() {
                                conversation.append(ConversationEntry::assistant(content));
                            }

                            match call {
                                Some(call) => {
                                    pending = Some(call);
                                    LoopState::AwaitingToolExecution
                                }
                                None => LoopState::Done,
                            }
                        }
                        Err(TurnFailure::Aborted) => {
                            aborted = true;
                            LoopState::Done
                        }
                        Err(TurnFailure::Provider(e)) => {
                            let kind = if e.is_transient() {
                                AgentErrorKind::ProviderUnavailable
                            } else {
                                AgentErrorKind::ProviderError
                            };
                            warn!(error = %e, ?kind, "Provider turn failed");
                            let message = e.to_string();
                            let _ = events.send(AgentEvent::Error {
                                kind,
                                message: message.clone(),
                            });
                            error = Some(AgentRunError { kind, message });
                            LoopState::Done
                        }
                    }
                }
                LoopState::AwaitingToolExecution => {
                    if let Some(call) = pending.take() {
                        self.execute_tool(call, &mut conversation, &events).await;
                        tool_calls += 1;
                        iterations += 1;
                    }
                    LoopState::AwaitingProviderTurn
                }
                LoopState::Done => LoopState::Done,
            };
        }

        let final_state = if aborted { state } else { LoopState::Done };
        info!(
            iterations,
            tool_calls,
            aborted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Agent run finished"
        );

        AgentRunResult {
            final_state,
            iterations,
            tool_calls,
            aborted,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            conversation,
        }
    }

    /// Tools stay declared past the iteration cap because the history still
    /// holds tool blocks; the cap only switches the tool choice to none.
    fn build_request(&self, conversation: &Conversation, tools_allowed: bool) -> CompletionRequest {
        let definitions = self.tools.declared_for(self.provider.api());
        let tools = (!definitions.is_empty()).then(|| self.provider.format_tools(&definitions));

        CompletionRequest {
            model: self.policy.model.clone(),
            messages: self.provider.format_messages(conversation.entries()),
            max_tokens: self.policy.max_tokens,
            temperature: self.policy.temperature,
            tools,
            tool_choice: if tools_allowed {
                ToolChoice::Auto
            } else {
                ToolChoice::None
            },
            system: self.system_prompt.clone(),
        }
    }

    /// One provider turn, retried on transient failures with a fixed backoff.
    async fn provider_turn(
        &self,
        conversation: &Conversation,
        tools_allowed: bool,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<ProviderTurn, TurnFailure> {
        let request = self.build_request(conversation, tools_allowed);
        let mut forwarder = TurnForwarder::new(events);
        let mut retries = 0u32;

        loop {
            match self.attempt_turn(&request, &mut forwarder).await {
                Ok(turn) => return Ok(turn),
                Err(TurnFailure::Provider(e))
                    if e.is_transient() && retries < self.policy.max_retries =>
                {
                    retries += 1;
                    warn!(retries, error = %e, "Transient provider failure, retrying turn");
                    tokio::select! {
                        _ = self.context.cancel.cancelled() => return Err(TurnFailure::Aborted),
                        _ = tokio::time::sleep(self.policy.retry_backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_turn(
        &self,
        request: &CompletionRequest,
        forwarder: &mut TurnForwarder<'_>,
    ) -> Result<ProviderTurn, TurnFailure> {
        forwarder.begin_attempt();
        let mut stream = tokio::select! {
            _ = self.context.cancel.cancelled() => return Err(TurnFailure::Aborted),
            opened = self.provider.stream(request, &self.credentials) => {
                opened.map_err(TurnFailure::Provider)?
            }
        };

        let mut turn = ProviderTurn::default();
        loop {
            let chunk = tokio::select! {
                _ = self.context.cancel.cancelled() => return Err(TurnFailure::Aborted),
                next = stream.next() => next,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(TurnFailure::Provider)?;

            if let Some(delta) = chunk.delta {
                turn.text.push_str(&delta);
                forwarder.forward(&turn.text);
            }
            if let Some(tool_use) = chunk.tool_use {
                if turn.tool_call.is_none() {
                    turn.tool_call = Some(tool_use);
                } else {
                    turn.extra_tool_calls += 1;
                }
            }
            if let Some(usage) = chunk.usage {
                turn.usage.input_tokens = usage.input_tokens.or(turn.usage.input_tokens);
                turn.usage.output_tokens = usage.output_tokens.or(turn.usage.output_tokens);
            }
            if let Some(reason) = chunk.stop_reason {
                turn.stop_reason = Some(reason);
            }
        }

        Ok(turn)
    }

    /// The single tool call this turn will execute, if any.
    fn accept_tool_call(&self, turn: &ProviderTurn, tools_allowed: bool) -> Option<ToolUseChunk> {
        let call = turn.tool_call.as_ref()?;
        if !tools_allowed {
            warn!(tool = %call.name, "Tool call after iteration limit ignored");
            return None;
        }
        if self.tools.get(&call.name).is_none() {
            warn!(tool = %call.name, "Model requested unknown tool");
            return None;
        }
        if turn.extra_tool_calls > 0 {
            warn!(dropped = turn.extra_tool_calls, "Only the first tool call of a turn runs");
        }
        if let Some(reason) = &turn.stop_reason {
            if !self.provider.is_tool_use_stop(reason) {
                debug!(reason = %reason, "Tool call with non tool-use stop reason");
            }
        }
        Some(call.clone())
    }

    async fn execute_tool(
        &self,
        call: ToolUseChunk,
        conversation: &mut Conversation,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) {
        let parsed = parse_arguments(&call.name, &call.input_json);
        let _ = events.send(AgentEvent::ToolCall {
            tool: call.name.clone(),
            params: recorded_input(&call.name, &call.input_json),
        });

        let output = match (parsed, self.tools.get(&call.name)) {
            (Err(e), _) => {
                warn!(tool = %call.name, error = %e, "Tool arguments rejected");
                ToolOutput::error(e.to_string())
            }
            (Ok(params), Some(tool)) => match tool.execute(params, &self.context).await {
                Ok(output) => output,
                Err(e) => ToolOutput::error(format!("Tool error: {e}")),
            },
            (Ok(_), None) => ToolOutput::error(format!("Unknown tool: {}", call.name)),
        };

        let mut media = output.media.unwrap_or_default();
        media.sort_by_key(|m| m.index);
        info!(
            tool = %call.name,
            is_error = output.is_error,
            images = media.len(),
            "Tool executed"
        );

        let _ = events.send(AgentEvent::ToolResult {
            tool: call.name.clone(),
            content: output.content.clone(),
            is_error: output.is_error,
            images: media.len(),
        });

        conversation.append(ConversationEntry::tool_result(
            call.id,
            call.name,
            output.content,
            output.is_error,
        ));

        if !media.is_empty() {
            let mut content = vec![ContentBlock::Text {
                text: PREVIEW_FRAMES_INSTRUCTION.to_string(),
            }];
            content.extend(media.into_iter().map(|m| ContentBlock::Image {
                source: ImageSource {
                    source_type: "base64".into(),
                    media_type: m.mime_type,
                    data: m.data,
                },
            }));
            conversation.append(ConversationEntry::user(content));
        }
    }
}

/// Tool arguments as a JSON object. An empty argument string counts as `{}`.
fn parse_arguments(tool: &str, input_json: &str) -> Result<serde_json::Value, AnimoError> {
    if input_json.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    let rejected = |message: String| AnimoError::ToolArgument {
        tool: tool.to_string(),
        message,
    };
    match serde_json::from_str::<serde_json::Value>(input_json) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(other) => Err(rejected(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(rejected(e.to_string())),
    }
}

/// Arguments as kept in history: parsed when valid, the model's raw text otherwise.
fn recorded_input(tool: &str, input_json: &str) -> serde_json::Value {
    parse_arguments(tool, input_json)
        .unwrap_or_else(|_| serde_json::Value::String(input_json.to_string()))
}

fn turn_usage_event(usage: &ChunkUsage) -> Option<AgentEvent> {
    if usage.input_tokens.is_none() && usage.output_tokens.is_none() {
        return None;
    }
    Some(AgentEvent::Usage {
        input_tokens: usage.input_tokens.unwrap_or(0),
        output_tokens: usage.output_tokens.unwrap_or(0),
    })
}
