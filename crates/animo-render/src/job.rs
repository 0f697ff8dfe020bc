//! Render jobs: source preparation, process supervision, and publishing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use animo_core::config::RenderConfig;
use animo_core::error::{AnimoError, Result};

use crate::frame::{AspectRatio, render_source};
use crate::progress::{ProgressEvent, ProgressParser};
use crate::publish::ArtifactPublisher;
use crate::runner::{self, OutputLine, OutputStream, RenderCommand, RunnerEvent, RunningProcess};

/// Scene class rendered when the caller does not name one.
pub const DEFAULT_CLASS_NAME: &str = "GenScene";

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SOURCE_FILE_NAME: &str = "scene.py";

/// One request to render a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub source_code: String,
    #[serde(default = "default_class_name")]
    pub entry_class_name: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    pub output_name_hint: String,
    #[serde(default)]
    pub streaming: bool,
}

fn default_class_name() -> String {
    DEFAULT_CLASS_NAME.to_string()
}

impl RenderRequest {
    pub fn new(source_code: impl Into<String>, output_name_hint: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            entry_class_name: default_class_name(),
            aspect_ratio: AspectRatio::default(),
            output_name_hint: output_name_hint.into(),
            streaming: false,
        }
    }

    pub fn with_class_name(mut self, class_name: Option<&str>) -> Self {
        self.entry_class_name = class_name
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CLASS_NAME)
            .to_string();
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.source_code.trim().is_empty() {
            return Err(AnimoError::Render("no source code provided".into()));
        }
        if !self
            .entry_class_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AnimoError::Render(format!(
                "invalid scene class name '{}'",
                self.entry_class_name
            )));
        }
        Ok(())
    }
}

/// Final result of a job consumed in buffered mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutcome {
    pub completed: bool,
    pub artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderOutcome {
    fn from_terminal(event: Option<ProgressEvent>) -> Self {
        match event {
            Some(ProgressEvent::Completed { artifact_url }) => Self {
                completed: true,
                artifact_url,
                error: None,
            },
            Some(ProgressEvent::Failed { message }) => Self {
                completed: false,
                artifact_url: None,
                error: Some(message),
            },
            _ => Self {
                completed: false,
                artifact_url: None,
                error: Some("render ended without a result".into()),
            },
        }
    }
}

/// Per-job scratch directory.
///
/// Owners call [`ScratchUnit::remove`] when done. Dropping an unremoved unit
/// (early return, cancelled task) deletes it synchronously instead.
pub(crate) struct ScratchUnit {
    dir: PathBuf,
    removed: bool,
}

impl ScratchUnit {
    async fn create(root: &Path, hint: &str, source: &str) -> Result<Self> {
        let prefix: String = hint
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .take(48)
            .collect();
        let prefix = if prefix.is_empty() { "job".to_string() } else { prefix };
        let dir = root.join(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        let unit = Self { dir, removed: false };
        tokio::fs::write(unit.source_path(), source).await?;
        Ok(unit)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn source_path(&self) -> PathBuf {
        self.dir.join(SOURCE_FILE_NAME)
    }

    pub(crate) async fn remove(mut self) {
        self.removed = true;
        log_removal(&self.dir, tokio::fs::remove_dir_all(&self.dir).await);
    }
}

impl Drop for ScratchUnit {
    fn drop(&mut self) {
        if !self.removed {
            log_removal(&self.dir, std::fs::remove_dir_all(&self.dir));
        }
    }
}

fn log_removal(dir: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!(dir = %dir.display(), "Removed scratch directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove scratch directory"),
    }
}

/// How a supervised process ended.
pub(crate) enum DriveResult {
    Exited { status: ExitStatus, stderr_tail: Vec<String> },
    /// A traceback was parsed and the process killed.
    Failed(String),
    Cancelled,
    TimedOut(Duration),
    Aborted(String),
}

enum Step {
    Cancelled,
    TimedOut,
    Event(Result<Option<RunnerEvent>>),
}

/// Launches render jobs against the configured renderer.
pub struct Renderer {
    config: RenderConfig,
    publisher: Arc<dyn ArtifactPublisher>,
}

impl Renderer {
    pub fn new(config: RenderConfig, publisher: Arc<dyn ArtifactPublisher>) -> Self {
        Self { config, publisher }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Start a job. Fails immediately if the renderer cannot be launched.
    pub async fn submit(&self, request: RenderRequest, cancel: CancellationToken) -> Result<JobHandle> {
        let format_arg = format!("--format={}", self.config.video_format);
        let (unit, process) = self.launch(&request, &[format_arg]).await?;

        let job_id = unit
            .dir()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(job = %job_id, class = %request.entry_class_name, ratio = request.aspect_ratio.as_str(), "Render job started");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let artifact = unit
            .dir()
            .join(format!("{}.{}", request.entry_class_name, self.config.video_format));
        let job = JobTask {
            id: job_id.clone(),
            unit,
            artifact,
            name_hint: request.output_name_hint,
            publisher: self.publisher.clone(),
            timeout: self.config.timeout_secs.map(Duration::from_secs),
            max_stderr_lines: self.config.max_stderr_lines,
        };
        tokio::spawn(job.run(process, tx, cancel));

        Ok(JobHandle { id: job_id, events: rx })
    }

    /// Write the prepared source to a fresh scratch unit and start the renderer on it.
    pub(crate) async fn launch(
        &self,
        request: &RenderRequest,
        format_args: &[String],
    ) -> Result<(ScratchUnit, RunningProcess)> {
        request.validate()?;
        let source = render_source(&request.source_code, &request.aspect_ratio.frame_config());
        let unit = ScratchUnit::create(
            &self.config.scratch_dir(),
            &request.output_name_hint,
            &source,
        )
        .await?;

        let mut command = RenderCommand::new(&self.config.command)
            .arg(unit.source_path().to_string_lossy())
            .arg(&request.entry_class_name);
        for arg in format_args {
            command = command.arg(arg);
        }
        command = command
            .arg("--media_dir")
            .arg(unit.dir().to_string_lossy())
            .arg("--custom_folders");
        if let Some(dir) = self.config.work_dir() {
            command = command.working_dir(dir);
        }

        let process = runner::spawn(&command)?;
        Ok((unit, process))
    }
}

/// Supervise `process`, forwarding parsed progress to `events` if given.
pub(crate) async fn drive(
    mut process: RunningProcess,
    events: Option<&mpsc::Sender<ProgressEvent>>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    max_stderr_lines: usize,
) -> DriveResult {
    let mut parser = ProgressParser::new();
    let mut stderr_tail: VecDeque<String> = VecDeque::new();

    let closed = async {
        match events {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(closed, deadline);

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Cancelled,
            _ = &mut closed => Step::Cancelled,
            _ = &mut deadline => Step::TimedOut,
            event = process.next_event() => Step::Event(event),
        };

        match step {
            Step::Cancelled => {
                process.kill().await;
                return DriveResult::Cancelled;
            }
            Step::TimedOut => {
                process.kill().await;
                return DriveResult::TimedOut(timeout.unwrap_or_default());
            }
            Step::Event(Err(e)) => {
                process.kill().await;
                return DriveResult::Aborted(e.to_string());
            }
            Step::Event(Ok(None)) => {
                return DriveResult::Aborted("renderer ended without an exit status".into());
            }
            Step::Event(Ok(Some(RunnerEvent::Exited(status)))) => {
                return DriveResult::Exited {
                    status,
                    stderr_tail: stderr_tail.into(),
                };
            }
            Step::Event(Ok(Some(RunnerEvent::Line(OutputLine {
                stream: OutputStream::Out,
                line,
            })))) => {
                debug!(target: "animo_render::stdout", "{line}");
            }
            Step::Event(Ok(Some(RunnerEvent::Line(OutputLine {
                stream: OutputStream::Err,
                line,
            })))) => {
                trace!(target: "animo_render::stderr", "{line}");
                for event in parser.feed(&line) {
                    if let ProgressEvent::Failed { message } = event {
                        process.kill().await;
                        return DriveResult::Failed(message);
                    }
                    if let Some(tx) = events {
                        if tx.send(event).await.is_err() {
                            process.kill().await;
                            return DriveResult::Cancelled;
                        }
                    }
                }
                if max_stderr_lines > 0 {
                    if stderr_tail.len() == max_stderr_lines {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line);
                }
            }
        }
    }
}

struct JobTask {
    id: String,
    unit: ScratchUnit,
    artifact: PathBuf,
    name_hint: String,
    publisher: Arc<dyn ArtifactPublisher>,
    timeout: Option<Duration>,
    max_stderr_lines: usize,
}

impl JobTask {
    async fn run(
        self,
        process: RunningProcess,
        tx: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) {
        let result = drive(process, Some(&tx), &cancel, self.timeout, self.max_stderr_lines).await;

        let terminal = match result {
            DriveResult::Exited { status, .. } if status.success() => Some(self.publish().await),
            DriveResult::Exited { status, stderr_tail } => {
                warn!(job = %self.id, %status, "Renderer exited with failure");
                let message = if stderr_tail.is_empty() {
                    format!("renderer exited with {status}")
                } else {
                    stderr_tail.join("\n")
                };
                Some(ProgressEvent::Failed { message })
            }
            DriveResult::Failed(message) => {
                warn!(job = %self.id, error = %message, "Render failed with traceback");
                Some(ProgressEvent::Failed { message })
            }
            DriveResult::Cancelled => {
                info!(job = %self.id, "Render job cancelled");
                None
            }
            DriveResult::TimedOut(after) => {
                warn!(job = %self.id, ?after, "Render job timed out");
                Some(ProgressEvent::Failed {
                    message: format!("render timed out after {}s", after.as_secs()),
                })
            }
            DriveResult::Aborted(message) => Some(ProgressEvent::Failed { message }),
        };

        // Scratch space goes before the caller learns the outcome.
        self.unit.remove().await;
        if let Some(event) = terminal {
            let _ = tx.send(event).await;
        }
    }

    async fn publish(&self) -> ProgressEvent {
        if !self.artifact.exists() {
            warn!(job = %self.id, path = %self.artifact.display(), "Renderer succeeded but produced no artifact");
            return ProgressEvent::Completed { artifact_url: None };
        }
        match self.publisher.publish(&self.artifact, &self.name_hint).await {
            Ok(url) => {
                info!(job = %self.id, %url, "Render job completed");
                ProgressEvent::Completed {
                    artifact_url: Some(url),
                }
            }
            Err(e) => {
                warn!(job = %self.id, error = %e, "Publishing artifact failed");
                ProgressEvent::Failed {
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Receiving side of a render job.
///
/// Dropping the handle (or the stream made from it) cancels the job.
pub struct JobHandle {
    id: String,
    events: mpsc::Receiver<ProgressEvent>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Streaming mode: every event as it is produced, terminal event last.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        ReceiverStream::new(self.events)
    }

    /// Buffered mode: drain the job and keep only its terminal event.
    pub async fn wait_outcome(mut self) -> RenderOutcome {
        let mut terminal = None;
        while let Some(event) = self.events.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
                break;
            }
        }
        RenderOutcome::from_terminal(terminal)
    }
}
