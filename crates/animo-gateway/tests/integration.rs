//! Gateway integration tests: start a real gateway and call it over HTTP.
//!
//! Run with: `cargo test -p animo-gateway --test integration`

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use serde_json::{Value, json};

use animo_core::config::Config;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// OpenAI-compatible endpoint that streams `reply` in two deltas.
async fn mock_openai(reply: &'static str) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            let (a, b) = reply.split_at(reply.len() / 2);
            let body = format!(
                "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
                json!({"choices": [{"delta": {"content": a}}]}),
                json!({"choices": [{"delta": {"content": b}, "finish_reason": "stop"}]}),
            );
            ([("content-type", "text/event-stream")], body)
        }),
    );
    serve(app).await
}

async fn mock_openai_unauthorized() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::UNAUTHORIZED, "invalid api key").into_response() }),
    );
    serve(app).await
}

struct TestGateway {
    base: String,
    client: reqwest::Client,
    _public: tempfile::TempDir,
    _scratch: tempfile::TempDir,
}

impl TestGateway {
    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

/// Build a gateway whose openai engine points at `provider_base`.
async fn start_test_gateway(provider_base: &str, render_command: &str) -> TestGateway {
    let port = find_free_port();
    let public = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let base = format!("http://127.0.0.1:{port}");

    let config: Config = serde_json::from_value(json!({
        "server": { "bind": "127.0.0.1", "port": port, "base_url": base },
        "render": { "command": render_command, "scratch_dir": scratch.path() },
        "storage": { "backend": "local", "public_dir": public.path() },
        "models": { "providers": [
            { "id": "openai", "api_key": "test-key", "base_url": provider_base }
        ]},
        "agent": { "max_retries": 0, "retry_backoff_ms": 1 },
    }))
    .unwrap();

    let state = Arc::new(animo_gateway::GatewayState::from_config(config).unwrap());
    tokio::spawn(async move {
        let _ = animo_gateway::start_gateway(state, port).await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if reqwest::get(format!("{base}/health")).await.is_ok() {
            break;
        }
    }

    TestGateway {
        base,
        client: reqwest::Client::new(),
        _public: public,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn root_and_health() {
    let provider = mock_openai("unused").await;
    let gw = start_test_gateway(&provider, "manim").await;

    let root = reqwest::get(&gw.base).await.unwrap();
    assert_eq!(root.text().await.unwrap(), "Generative Manim Processor");

    let health: Value = reqwest::get(format!("{}/health", gw.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["engines"], json!(["openai"]));
}

#[tokio::test]
async fn code_generation_returns_code() {
    let provider = mock_openai("class GenScene(Scene): pass").await;
    let gw = start_test_gateway(&provider, "manim").await;

    for path in ["/v1/code/generation", "/generate-code"] {
        let resp = gw.post(path, json!({"prompt": "a circle"})).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "class GenScene(Scene): pass");
    }
}

#[tokio::test]
async fn code_generation_provider_failure_is_500() {
    let provider = mock_openai_unauthorized().await;
    let gw = start_test_gateway(&provider, "manim").await;

    let resp = gw.post("/v1/code/generation", json!({"prompt": "a circle"})).await;
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid api key"));
}

#[tokio::test]
async fn chat_generation_platform_framing() {
    let provider = mock_openai("Hi \"you\"").await;
    let gw = start_test_gateway(&provider, "manim").await;

    let resp = gw
        .post(
            "/v1/chat/generation",
            json!({
                "messages": [{"role": "user", "content": "draw a square"}],
                "engine": "openai",
                "isForPlatform": true,
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let body = resp.text().await.unwrap();
    assert!(body.lines().all(|l| l.starts_with("0:")));
    assert_eq!(
        animo_agent::wire::decode_platform_frames(&body).unwrap(),
        "Hi \"you\""
    );
}

#[tokio::test]
async fn chat_generation_event_stream() {
    let provider = mock_openai("Here you go").await;
    let gw = start_test_gateway(&provider, "manim").await;

    let resp = gw
        .post(
            "/v1/chat/generation",
            json!({"messages": [{"role": "user", "content": "hello"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.text().await.unwrap(), "Here you go");
}

#[tokio::test]
async fn chat_generation_provider_error_is_streamed() {
    let provider = mock_openai_unauthorized().await;
    let gw = start_test_gateway(&provider, "manim").await;

    let resp = gw
        .post(
            "/v1/chat/generation",
            json!({"messages": [{"role": "user", "content": "hello"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("Error: "), "got {body:?}");
}

#[tokio::test]
async fn chat_generation_unknown_engine() {
    let provider = mock_openai("unused").await;
    let gw = start_test_gateway(&provider, "manim").await;

    let resp = gw
        .post(
            "/v1/chat/generation",
            json!({"messages": [{"role": "user", "content": "hi"}], "engine": "mystery"}),
        )
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn video_rendering_requires_code() {
    let provider = mock_openai("unused").await;
    let gw = start_test_gateway(&provider, "manim").await;

    for body in [json!({}), json!({"code": "   "})] {
        let resp = gw.post("/v1/video/rendering", body).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "No code provided");
    }
}

#[cfg(unix)]
mod rendering {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::LazyLock;

    static FAKE_RENDERER: LazyLock<PathBuf> = LazyLock::new(|| {
        let dir = std::env::temp_dir().join(format!("animo-gateway-renderer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake-manim");
        std::fs::write(
            &script,
            r#"#!/bin/sh
src="$1"; class="$2"; shift 2
media=""
while [ $# -gt 0 ]; do
  case "$1" in
    --media_dir) media="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if grep -q BROKEN "$src"; then
  printf 'Traceback (most recent call last)\n  File "scene.py", line 7\nNameError: name Circl is not defined\n\n' >&2
  exit 1
fi
echo "Animation 0: Create(Circle)" >&2
echo "50%" >&2
echo "100%" >&2
printf 'video' > "$media/$class.mp4"
exit 0
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    });

    async fn gateway() -> TestGateway {
        let provider = mock_openai("unused").await;
        start_test_gateway(&provider, &FAKE_RENDERER.display().to_string()).await
    }

    #[tokio::test]
    async fn streaming_progress_then_url() {
        let gw = gateway().await;
        let resp = gw
            .post(
                "/v1/video/rendering",
                json!({
                    "code": "class GenScene(Scene):\n    pass",
                    "file_class": "GenScene",
                    "user_id": "u1",
                    "project_name": "demo",
                    "iteration": 1,
                    "stream": true,
                }),
            )
            .await;
        assert_eq!(resp.status(), 207);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let body = resp.text().await.unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0], json!({"animationIndex": 0, "percentage": 0}));
        assert_eq!(lines[1], json!({"animationIndex": 0, "percentage": 50}));
        let url = format!("{}/public/video-u1-demo-1.mp4", gw.base);
        assert_eq!(lines.last().unwrap(), &json!({"video_url": url}));

        let served = reqwest::get(&url).await.unwrap();
        assert_eq!(served.status(), 200);
        assert_eq!(served.text().await.unwrap(), "video");
    }

    #[tokio::test]
    async fn buffered_completion() {
        let gw = gateway().await;
        let resp = gw
            .post(
                "/code-to-video",
                json!({"code": "class GenScene(Scene):\n    pass", "aspect_ratio": "1:1"}),
            )
            .await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["message"], "Video generation completed");
        assert_eq!(
            body["video_url"],
            format!("{}/public/video-anonymous-untitled-0.mp4", gw.base)
        );
    }

    #[tokio::test]
    async fn buffered_failure_reports_traceback() {
        let gw = gateway().await;
        let resp = gw
            .post("/v1/video/rendering", json!({"code": "# BROKEN\nCircl()"}))
            .await;
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("NameError"));
    }
}
