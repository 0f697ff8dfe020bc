//! Scene rendering: progress stream or buffered result.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use animo_render::{AspectRatio, RenderRequest};

use crate::error::ApiError;
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub struct VideoRenderingBody {
    #[serde(default)]
    pub code: Option<String>,
    /// Accepted for compatibility; every job gets its own scratch file.
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_class: Option<String>,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub iteration: Option<serde_json::Value>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

fn default_user_id() -> String {
    "anonymous".into()
}

impl VideoRenderingBody {
    /// Published name: `video-{user_id}-{project_name}-{iteration}`.
    pub fn artifact_name(&self) -> String {
        let iteration = match &self.iteration {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => "0".into(),
            Some(other) => other.to_string(),
        };
        format!(
            "video-{}-{}-{}",
            self.user_id,
            self.project_name.as_deref().unwrap_or("untitled"),
            iteration
        )
    }
}

pub async fn render_video(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<VideoRenderingBody>,
) -> Result<Response, ApiError> {
    let code = match body.code.as_deref() {
        Some(code) if !code.trim().is_empty() => code.to_string(),
        _ => return Err(ApiError::bad_request("No code provided")),
    };

    let request = RenderRequest::new(code, body.artifact_name())
        .with_class_name(body.file_class.as_deref())
        .with_aspect_ratio(AspectRatio::parse(body.aspect_ratio.as_deref()));

    let cancel = CancellationToken::new();
    let handle = state
        .renderer
        .submit(request, cancel.clone())
        .await
        .map_err(|e| {
            warn!(error = %e, "Render job could not start");
            ApiError::internal(e.to_string())
        })?;
    info!(job = %handle.id(), stream = body.stream, "Render request accepted");

    // Dropping the guard (client gone) kills the renderer.
    let guard = cancel.drop_guard();

    if body.stream {
        let lines = handle.into_stream().map(move |event| {
            let _guard = &guard;
            Ok::<_, Infallible>(event.to_wire_line())
        });
        return Ok((
            StatusCode::MULTI_STATUS,
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(lines),
        )
            .into_response());
    }

    let outcome = handle.wait_outcome().await;
    drop(guard);

    if !outcome.completed {
        let message = outcome
            .error
            .unwrap_or_else(|| "render ended without a result".into());
        return Err(ApiError::internal(message));
    }

    let reply = match outcome.artifact_url {
        Some(video_url) => json!({
            "message": "Video generation completed",
            "video_url": video_url,
        }),
        None => json!({
            "message": "Video generation completed, but no URL was found",
        }),
    };
    Ok((StatusCode::OK, Json(reply)).into_response())
}
