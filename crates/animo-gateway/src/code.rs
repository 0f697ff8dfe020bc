//! One-shot code generation.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use animo_agent::prompt::CODE_GENERATION_PROMPT;
use animo_core::conversation::ConversationEntry;
use animo_core::types::ContentBlock;
use animo_providers::{CompletionRequest, ToolChoice};

use crate::error::ApiError;
use crate::state::GatewayState;

const CODE_MAX_TOKENS: u32 = 1000;
const CODE_TEMPERATURE: f64 = 0.2;

#[derive(Debug, Deserialize)]
pub struct CodeGenerationBody {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "gpt-4o".into()
}

#[derive(Debug, Serialize)]
pub struct CodeGenerationReply {
    pub code: String,
}

pub async fn generate_code(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<CodeGenerationBody>,
) -> Result<Json<CodeGenerationReply>, ApiError> {
    let entry = state
        .providers
        .for_model(&body.model)
        .ok_or_else(|| ApiError::internal(format!("No provider configured for model '{}'", body.model)))?;

    let messages = entry
        .provider
        .format_messages(&[ConversationEntry::user(vec![ContentBlock::Text {
            text: body.prompt,
        }])]);
    let request = CompletionRequest {
        model: body.model.clone(),
        messages,
        max_tokens: CODE_MAX_TOKENS,
        temperature: Some(CODE_TEMPERATURE),
        tools: None,
        tool_choice: ToolChoice::Auto,
        system: Some(CODE_GENERATION_PROMPT.to_string()),
    };

    match entry.provider.complete(&request, &entry.credentials).await {
        Ok(code) => {
            info!(model = %body.model, chars = code.len(), "Code generated");
            Ok(Json(CodeGenerationReply { code }))
        }
        Err(e) => {
            warn!(model = %body.model, error = %e, "Code generation failed");
            Err(ApiError::internal(e.to_string()))
        }
    }
}
