//! Streamed chat generation through the agent loop.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use animo_agent::prompt::build_system_prompt;
use animo_agent::{AgentLoop, Framing, LoopPolicy};
use animo_core::conversation::Conversation;
use animo_core::types::ChatMessage;
use animo_render::AspectRatio;
use animo_tools::ToolContext;

use crate::error::ApiError;
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGenerationBody {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub is_for_platform: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

fn default_engine() -> String {
    "openai".into()
}

pub async fn generate_chat(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<ChatGenerationBody>,
) -> Result<Response, ApiError> {
    let entry = state
        .providers
        .get(&body.engine)
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("Engine '{}' is not configured", body.engine)))?;

    let (conversation, caller_system) = Conversation::from_chat_messages(&body.messages);
    if conversation.is_empty() {
        return Err(ApiError::bad_request("No messages provided"));
    }

    let framing = Framing::for_platform(body.is_for_platform);
    let model = body.model.unwrap_or_else(|| entry.default_model.clone());
    let policy = LoopPolicy::from_config(&state.config, model);
    let system_prompt =
        build_system_prompt(&state.tools, policy.max_iterations, caller_system.as_deref());

    let cancel = CancellationToken::new();
    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let context = ToolContext {
        renderer: state.renderer.clone(),
        cancel: cancel.clone(),
        aspect_ratio: AspectRatio::parse(body.aspect_ratio.as_deref()),
        name_hint: format!("chat-{request_id}"),
    };
    let agent = AgentLoop::new(
        entry.provider,
        entry.credentials,
        state.tools.clone(),
        context,
        policy,
    )
    .with_system_prompt(system_prompt);

    info!(request = %request_id, engine = %body.engine, ?framing, "Chat generation started");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let result = agent.run(conversation, tx).await;
        info!(
            request = %request_id,
            tool_calls = result.tool_calls,
            aborted = result.aborted,
            duration_ms = result.duration_ms,
            "Chat generation finished"
        );
    });

    // Dropping the body (client gone) cancels the run and any preview render.
    let guard = cancel.drop_guard();
    let frames = UnboundedReceiverStream::new(rx).filter_map(move |event| {
        let _guard = &guard;
        framing.encode_event(&event).map(Ok::<_, Infallible>)
    });

    Ok((
        [(header::CONTENT_TYPE, framing.content_type())],
        Body::from_stream(frames),
    )
        .into_response())
}
