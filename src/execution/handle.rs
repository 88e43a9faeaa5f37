//! Execution handles and the output capture loop.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::process;
use crate::console::ConsoleBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Paused,
}

/// Snapshot of one execution, as returned by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub project_id: String,
    pub pid: u32,
    pub state: RunState,
    pub alive: bool,
    pub working_directory: String,
    pub command: Vec<String>,
    /// Unix time in milliseconds.
    pub started_at: u64,
}

/// The supervisor's record of one running project process.
pub struct ExecutionHandle {
    pub project_id: String,
    /// Process id, which is also the process group id.
    pub pid: u32,
    /// Distinguishes this launch from earlier ones for the same project.
    pub generation: u64,
    pub working_directory: String,
    pub command: Vec<String>,
    pub started_at: u64,
    pub state: RunState,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    /// Set once the process itself has been reaped, even if descendants
    /// still hold its output open.
    exited: Arc<AtomicBool>,
}

impl ExecutionHandle {
    pub fn new(
        project_id: &str,
        pid: u32,
        generation: u64,
        working_directory: &str,
        command: Vec<String>,
        stdin: ChildStdin,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            pid,
            generation,
            working_directory: working_directory.to_string(),
            command,
            started_at: now_millis(),
            state: RunState::Running,
            stdin_tx: spawn_stdin_writer(stdin),
            cancel,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the supervising task sets when it reaps the process.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exited)
    }

    /// False once the process has exited, whether or not it was reaped yet.
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire) && process::is_alive(self.pid)
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus {
            project_id: self.project_id.clone(),
            pid: self.pid,
            state: self.state,
            alive: self.is_alive(),
            working_directory: self.working_directory.clone(),
            command: self.command.clone(),
            started_at: self.started_at,
        }
    }

    /// Sender feeding the process's stdin.
    pub fn stdin(&self) -> mpsc::Sender<Vec<u8>> {
        self.stdin_tx.clone()
    }

    /// Signal the whole process group.
    pub fn signal(&self, signal: Signal) -> Result<(), Errno> {
        process::signal_group(self.pid, signal)
    }

    /// Cancel capture and SIGKILL the process group. The capture task reaps.
    pub fn terminate(&self) {
        self.cancel.cancel();
        match self.signal(Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {} ({}): {e}", self.pid, self.project_id),
        }
    }
}

/// Forward queued input to the child's stdin until either side closes.
fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if stdin.write_all(&data).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// How the capture loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The process closed its output.
    EndOfStream,
    /// Stopped through the cancellation token.
    Cancelled,
    /// Reading failed.
    Failed(String),
}

/// Read `output` line by line and publish each line to the project's
/// console in read order.
pub async fn capture_lines<R>(
    project_id: &str,
    output: R,
    console: &ConsoleBus,
    cancel: &CancellationToken,
) -> CaptureOutcome
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return CaptureOutcome::Cancelled,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => return CaptureOutcome::EndOfStream,
                Ok(_) => {
                    console.publish(project_id, decode_line(&buf)).await;
                }
                Err(e) => return CaptureOutcome::Failed(e.to_string()),
            },
        }
    }
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
