//! Scene preview tool: renders still frames so the model can see its scene.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use animo_render::RenderRequest;

use crate::{Tool, ToolContext, ToolMedia, ToolOutput};

#[derive(Debug, Deserialize)]
struct PreviewParams {
    code: String,
    #[serde(default)]
    class_name: Option<String>,
}

pub struct PreviewTool;

#[async_trait]
impl Tool for PreviewTool {
    fn name(&self) -> &str {
        "preview"
    }

    fn description(&self) -> &str {
        "Render a low-quality preview of a Manim scene and return sampled frames as images. \
         Use it to check layout and motion before giving the final code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Complete Python source defining the scene class"
                },
                "class_name": {
                    "type": "string",
                    "description": "Scene class to render (default: GenScene)"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: PreviewParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return Ok(ToolOutput::error(format!("Invalid arguments for preview: {e}")));
            }
        };
        if params.code.trim().is_empty() {
            return Ok(ToolOutput::error("Invalid arguments for preview: 'code' is empty"));
        }

        let request = RenderRequest::new(params.code, format!("{}-preview", context.name_hint))
            .with_class_name(params.class_name.as_deref())
            .with_aspect_ratio(context.aspect_ratio);

        let frames = match context.renderer.render_preview(request, &context.cancel).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Preview render failed");
                return Ok(ToolOutput::error(format!("Preview render failed: {e}")));
            }
        };

        info!(frames = frames.len(), "Preview tool produced frames");
        let content = if frames.is_empty() {
            "The scene rendered but produced no frames.".to_string()
        } else {
            format!("Rendered {} preview frames.", frames.len())
        };
        let media: Vec<ToolMedia> = frames
            .into_iter()
            .map(|f| ToolMedia {
                mime_type: "image/png".into(),
                data: f.data,
                index: f.index,
            })
            .collect();

        Ok(ToolOutput {
            content,
            is_error: false,
            media: (!media.is_empty()).then_some(media),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use animo_core::config::RenderConfig;
    use animo_render::{AspectRatio, LocalPublisher, Renderer};
    use tokio_util::sync::CancellationToken;

    fn context(command: &str, scratch: &std::path::Path) -> ToolContext {
        let config = RenderConfig {
            command: command.into(),
            scratch_dir: Some(scratch.display().to_string()),
            ..RenderConfig::default()
        };
        ToolContext {
            renderer: Arc::new(Renderer::new(
                config,
                Arc::new(LocalPublisher::new(scratch, "http://h")),
            )),
            cancel: CancellationToken::new(),
            aspect_ratio: AspectRatio::Square,
            name_hint: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_become_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("/nonexistent/manim", dir.path());
        let output = PreviewTool
            .execute(json!({"source": "x"}), &ctx)
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn test_render_failure_becomes_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("/nonexistent/manim", dir.path());
        let output = PreviewTool
            .execute(json!({"code": "class GenScene(Scene): pass"}), &ctx)
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.starts_with("Preview render failed"));
        assert!(output.media.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_returned_as_indexed_media() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("frame.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]))
            .save(&frame)
            .unwrap();
        let script = dir.path().join("fake-manim");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nwhile [ $# -gt 0 ]; do [ \"$1\" = --media_dir ] && media=\"$2\"; shift; done\n\
                 for i in 0 1 2 3 4 5; do cp {} \"$media/GenScene000$i.png\"; done\n",
                frame.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ctx = context(&script.display().to_string(), dir.path());
        let output = PreviewTool
            .execute(json!({"code": "class GenScene(Scene): pass"}), &ctx)
            .await
            .unwrap();
        assert!(!output.is_error, "{}", output.content);
        let media = output.media.unwrap();
        let indices: Vec<u32> = media.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 4]);
        assert_eq!(output.content, "Rendered 2 preview frames.");
    }
}
