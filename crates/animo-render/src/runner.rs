//! Spawns the renderer and merges its two output pipes into one ordered
//! sequence of lines.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use animo_core::error::{AnimoError, Result};

const READ_CHUNK: usize = 8 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Out,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug)]
pub enum RunnerEvent {
    Line(OutputLine),
    /// Emitted once, after both pipes are exhausted and the child is reaped.
    Exited(ExitStatus),
}

/// Program, arguments, and working directory for one renderer invocation.
#[derive(Debug, Clone)]
pub struct RenderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl RenderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// A running renderer process.
pub struct RunningProcess {
    child: Child,
    lines: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    exited: bool,
}

/// Launch `command` with both pipes captured.
pub fn spawn(command: &RenderCommand) -> Result<RunningProcess> {
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| AnimoError::Launch(format!("{}: {e}", command.program)))?;

    debug!(program = %command.program, args = ?command.args, pid = ?child.id(), "Renderer started");

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Out, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Err, tx));
    }

    Ok(RunningProcess {
        child,
        lines: rx,
        readers,
        exited: false,
    })
}

impl RunningProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next line from either pipe, then a single `Exited`, then `None`.
    pub async fn next_event(&mut self) -> Result<Option<RunnerEvent>> {
        if self.exited {
            return Ok(None);
        }
        if let Some(line) = self.lines.recv().await {
            return Ok(Some(RunnerEvent::Line(line)));
        }
        // Both senders dropped: both pipes hit EOF.
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(Some(RunnerEvent::Exited(status)))
    }

    /// Terminate the child and reap it. No-op once it has exited.
    pub async fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill renderer process");
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.exited = true;
    }
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(?stream, error = %e, "Renderer pipe read failed");
                    break;
                }
            };
            for line in splitter.push(&buf[..n]) {
                if tx.send(OutputLine { stream, line }).await.is_err() {
                    return;
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send(OutputLine { stream, line }).await;
        }
    })
}

/// Splits a byte stream into lines on `\n`, `\r`, or `\r\n`.
///
/// Progress bars redraw with bare carriage returns, so `\r` must end a line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    last_was_cr: bool,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' if self.last_was_cr => {
                    self.last_was_cr = false;
                }
                b'\n' | b'\r' => {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                    self.last_was_cr = b == b'\r';
                }
                _ => {
                    self.pending.push(b);
                    self.last_was_cr = false;
                }
            }
        }
        lines
    }

    /// Trailing text without a terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_handles_cr_and_crlf() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"a\r\nb\rc\nd");
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(splitter.finish(), Some("d".into()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_crlf_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(b"x\r"), vec!["x"]);
        assert!(splitter.push(b"\n").is_empty());
        assert_eq!(splitter.push(b"\n"), vec![""]);
    }

    #[test]
    fn test_splitter_keeps_blank_lines() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(b"err\n\nnext\n"), vec!["err", "", "next"]);
    }

    #[test]
    fn test_splitter_multibyte_split_between_chunks() {
        let mut splitter = LineSplitter::default();
        let text = "héllo\n".as_bytes();
        assert!(splitter.push(&text[..2]).is_empty());
        assert_eq!(splitter.push(&text[2..]), vec!["héllo"]);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_launch_error() {
        let result = spawn(&RenderCommand::new("/nonexistent/animo-renderer-binary"));
        assert!(matches!(result, Err(AnimoError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_both_streams_drained_before_exit() {
        let command = RenderCommand::new("sh")
            .arg("-c")
            .arg("echo out1; echo err1 >&2; echo out2; echo err2 >&2; exit 3");
        let mut process = spawn(&command).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut status = None;
        while let Some(event) = process.next_event().await.unwrap() {
            match event {
                RunnerEvent::Line(OutputLine { stream: OutputStream::Out, line }) => out.push(line),
                RunnerEvent::Line(OutputLine { stream: OutputStream::Err, line }) => err.push(line),
                RunnerEvent::Exited(s) => {
                    assert!(status.is_none(), "exit reported twice");
                    status = Some(s);
                }
            }
        }
        assert_eq!(out, vec!["out1", "out2"]);
        assert_eq!(err, vec!["err1", "err2"]);
        assert_eq!(status.unwrap().code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_output_on_one_pipe_does_not_deadlock() {
        // Far more than a pipe buffer on stderr while stdout stays quiet.
        let command = RenderCommand::new("sh")
            .arg("-c")
            .arg("i=0; while [ $i -lt 20000 ]; do echo line-$i >&2; i=$((i+1)); done; echo done");
        let mut process = spawn(&command).unwrap();
        let mut err_count = 0;
        let mut saw_done = false;
        while let Some(event) = process.next_event().await.unwrap() {
            if let RunnerEvent::Line(line) = event {
                match line.stream {
                    OutputStream::Err => err_count += 1,
                    OutputStream::Out => saw_done = line.line == "done",
                }
            }
        }
        assert_eq!(err_count, 20000);
        assert!(saw_done);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_process() {
        let mut process = spawn(&RenderCommand::new("sleep").arg("30")).unwrap();
        process.kill().await;
        assert!(process.next_event().await.unwrap().is_none());
    }
}
