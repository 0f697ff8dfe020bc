//! Still-frame previews: render PNG frames at low quality and downsample them.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use animo_core::error::{AnimoError, Result};

use crate::job::{DriveResult, RenderRequest, Renderer, ScratchUnit, drive};
use crate::runner::RunningProcess;

/// One downsampled preview frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewFrame {
    /// Frame number in the rendered sequence.
    pub index: u32,
    /// Base64-encoded PNG.
    pub data: String,
}

impl Renderer {
    /// Render `request` as an image sequence and return every Nth frame,
    /// downscaled, in frame order.
    pub async fn render_preview(
        &self,
        request: RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreviewFrame>> {
        let args = vec![
            "--format=png".to_string(),
            self.config().preview_quality_flag.clone(),
        ];
        let (unit, process) = self.launch(&request, &args).await?;
        let frames = self.capture_frames(&unit, process, cancel).await;
        unit.remove().await;
        frames
    }

    async fn capture_frames(
        &self,
        unit: &ScratchUnit,
        process: RunningProcess,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreviewFrame>> {
        let config = self.config();
        let timeout = config.timeout_secs.map(std::time::Duration::from_secs);
        match drive(process, None, cancel, timeout, config.max_stderr_lines).await {
            DriveResult::Exited { status, .. } if status.success() => {}
            DriveResult::Exited { status, stderr_tail } => {
                let message = if stderr_tail.is_empty() {
                    format!("renderer exited with {status}")
                } else {
                    stderr_tail.join("\n")
                };
                return Err(AnimoError::Render(message));
            }
            DriveResult::Failed(message) | DriveResult::Aborted(message) => {
                return Err(AnimoError::Render(message));
            }
            DriveResult::Cancelled => return Err(AnimoError::Render("preview cancelled".into())),
            DriveResult::TimedOut(after) => {
                return Err(AnimoError::Render(format!(
                    "preview timed out after {}s",
                    after.as_secs()
                )));
            }
        }

        let stride = config.preview_frame_stride.max(1);
        let downscale = config.preview_downscale.max(1);
        let frames = collect_frames(unit.dir()).await?;
        debug!(total = frames.len(), stride, "Collected preview frames");

        let selected: Vec<(u32, PathBuf)> = frames.into_iter().step_by(stride).collect();
        let encoded = tokio::task::spawn_blocking(move || {
            selected
                .into_iter()
                .map(|(index, path)| {
                    downsample(&path, downscale).map(|data| PreviewFrame { index, data })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| AnimoError::Render(format!("frame encoding task failed: {e}")))??;

        info!(frames = encoded.len(), "Preview rendered");
        Ok(encoded)
    }
}

/// All PNG files under `dir`, ordered by their trailing frame number.
async fn collect_frames(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("png") {
                found.push(path);
            }
        }
    }

    let mut numbered: Vec<(u32, PathBuf)> = found
        .into_iter()
        .map(|path| (frame_number(&path).unwrap_or(0), path))
        .collect();
    numbered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(numbered)
}

/// Trailing digits of the file stem, e.g. `GenScene0042.png` -> 42.
fn frame_number(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

fn downsample(path: &Path, factor: u32) -> Result<String> {
    let img = image::open(path)
        .map_err(|e| AnimoError::Render(format!("decode {}: {e}", path.display())))?;
    let width = (img.width() / factor).max(1);
    let height = (img.height() / factor).max(1);
    let small = img.resize_exact(width, height, FilterType::Triangle);

    let mut buf = Cursor::new(Vec::new());
    small
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| AnimoError::Render(format!("encode frame: {e}")))?;
    Ok(STANDARD.encode(buf.into_inner()))
}
