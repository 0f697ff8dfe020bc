//! Axum HTTP server.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::GatewayState;
use crate::{chat, code, video};

/// All routes, with tracing and permissive CORS.
pub fn router(state: Arc<GatewayState>) -> Router {
    let public_dir = state.config.public_dir();

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/v1/code/generation", post(code::generate_code))
        .route("/generate-code", post(code::generate_code))
        .route("/v1/chat/generation", post(chat::generate_chat))
        .route("/v1/video/rendering", post(video::render_video))
        .route("/code-to-video", post(video::render_video))
        .nest_service("/public", ServeDir::new(public_dir))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let app = router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn root_handler() -> &'static str {
    "Generative Manim Processor"
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    Json(json!({
        "status": "ok",
        "version": version,
        "engines": state.providers.engines(),
    }))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C; serving until the process exits");
            std::future::pending::<()>().await;
        }
    }
}
