//! Project process lifecycle.
//!
//! [`ExecutionSupervisor`] is the single authority for starting and stopping
//! project processes. Each running project has one [`ExecutionHandle`] and one
//! capture task that publishes its merged output to the [`ConsoleBus`].
//!
//! ## Cleanup
//!
//! A handle is removed exactly once, by whichever comes first:
//!
//! - [`ExecutionSupervisor::stop`], which also removes the project's route and
//!   closes its console channel;
//! - the supervising task once the process has exited and its output has
//!   reached end of stream. It only removes the handle whose generation it
//!   was started with, so a later launch under the same project id is never
//!   touched. Route and console are then released or retained according to
//!   [`ExitPolicy`].
//!
//! The process is reaped as soon as it exits, independently of its output.
//! Descendants may keep the pipe open after that; the handle then reports the
//! project as not running while capture drains what they still write.
//!
//! ## Concurrency
//!
//! The handle map is behind an `RwLock`. `start` holds the write lock across
//! the liveness check, spawn and insert so two starts for one project cannot
//! both launch. `stop` and `finish` keep it while releasing route and
//! console, so a start queued behind them never loses its fresh route.

pub mod handle;
pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExitPolicy;
use crate::console::ConsoleBus;
use crate::error::GatewayError;
use crate::registry::RouteRegistry;
use handle::{CaptureOutcome, ExecutionHandle, ExecutionStatus, RunState};

/// Prefix of the console line published when output capture fails.
pub const STREAM_ERROR_PREFIX: &str = "[ERROR] ";

/// One launch as seen by its supervising task.
struct Watch {
    project_id: String,
    generation: u64,
    pid: u32,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
}

/// Cloneable; all clones share the same handle table.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    handles: Arc<RwLock<HashMap<String, ExecutionHandle>>>,
    registry: RouteRegistry,
    console: ConsoleBus,
    exit_policy: ExitPolicy,
    generations: Arc<AtomicU64>,
}

impl ExecutionSupervisor {
    pub fn new(registry: RouteRegistry, console: ConsoleBus, exit_policy: ExitPolicy) -> Self {
        Self {
            handles: Arc::new(RwLock::new(HashMap::new())),
            registry,
            console,
            exit_policy,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Launch `command args..` in `working_directory` for `project_id`.
    ///
    /// Returns once the process is running; output capture continues in the
    /// background. A stale handle whose process already died is replaced.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ProcessLaunchFailure`]: empty command, missing
    ///   binary, or unusable working directory
    /// - [`GatewayError::AlreadyRunning`]: the project has a live process
    pub async fn start(
        &self,
        project_id: &str,
        working_directory: &str,
        command: &str,
        args: &[String],
    ) -> Result<ExecutionStatus, GatewayError> {
        if command.trim().is_empty() {
            return Err(GatewayError::ProcessLaunchFailure {
                project_id: project_id.to_string(),
                reason: "empty command".to_string(),
            });
        }

        let mut handles = self.handles.write().await;
        if handles.get(project_id).is_some_and(ExecutionHandle::is_alive) {
            return Err(GatewayError::AlreadyRunning(project_id.to_string()));
        }
        if let Some(stale) = handles.remove(project_id) {
            debug!("Replacing stale handle for {project_id} (pid {})", stale.pid);
            stale.terminate();
        }

        let spawned = process::spawn_merged(working_directory, command, args).map_err(|e| {
            warn!("Failed to launch {command} for {project_id}: {e}");
            GatewayError::ProcessLaunchFailure {
                project_id: project_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        let pid = spawned.child.id().unwrap_or(0);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let mut full_command = Vec::with_capacity(args.len() + 1);
        full_command.push(command.to_string());
        full_command.extend_from_slice(args);

        let handle = ExecutionHandle::new(
            project_id,
            pid,
            generation,
            working_directory,
            full_command,
            spawned.stdin,
            cancel.clone(),
        );
        let status = handle.status();
        let watch = Watch {
            project_id: project_id.to_string(),
            generation,
            pid,
            cancel,
            exited: handle.exit_flag(),
        };
        handles.insert(project_id.to_string(), handle);
        drop(handles);

        tokio::spawn(self.clone().supervise(watch, spawned.child, spawned.output));

        info!("Started {project_id} (pid {pid}) in {working_directory}: {command}");
        Ok(status)
    }

    /// Capture output and reap the process, then clean up once both are done.
    async fn supervise<R>(self, watch: Watch, mut child: Child, output: R)
    where
        R: AsyncRead + Unpin,
    {
        let Watch {
            project_id,
            generation,
            pid,
            cancel,
            exited,
        } = watch;

        let capture = self.capture_output(&project_id, output, &cancel);
        tokio::pin!(capture);
        let mut reaped = None;
        let outcome = loop {
            tokio::select! {
                outcome = &mut capture => break outcome,
                status = child.wait(), if reaped.is_none() => {
                    exited.store(true, Ordering::Release);
                    debug!("{project_id} (pid {pid}) exited; draining remaining output");
                    reaped = Some(status);
                }
            }
        };

        if matches!(outcome, CaptureOutcome::Failed(_)) {
            if let Err(e) = process::signal_group(pid, Signal::SIGKILL) {
                debug!("Kill after stream failure for {project_id}: {e}");
            }
        }

        let status = match reaped {
            Some(status) => status,
            None => child.wait().await,
        };
        exited.store(true, Ordering::Release);
        match status {
            Ok(status) => info!("{project_id} (pid {pid}) exited: {status}"),
            Err(e) => warn!("Failed to reap {project_id} (pid {pid}): {e}"),
        }
        self.finish(&project_id, generation).await;
    }

    /// Publish `output` to the project's console. A read failure is reported
    /// on the console as one `[ERROR] ` line.
    async fn capture_output<R>(
        &self,
        project_id: &str,
        output: R,
        cancel: &CancellationToken,
    ) -> CaptureOutcome
    where
        R: AsyncRead + Unpin,
    {
        let outcome = handle::capture_lines(project_id, output, &self.console, cancel).await;
        match &outcome {
            CaptureOutcome::EndOfStream => debug!("Output of {project_id} reached end of stream"),
            CaptureOutcome::Cancelled => debug!("Output capture for {project_id} cancelled"),
            CaptureOutcome::Failed(reason) => {
                let err = GatewayError::ProcessStreamFailure {
                    project_id: project_id.to_string(),
                    reason: reason.clone(),
                };
                warn!("{project_id}: {err}");
                self.console
                    .publish(project_id, format!("{STREAM_ERROR_PREFIX}{err}"))
                    .await;
            }
        }
        outcome
    }

    /// Drop the handle for `generation` if it is still the current one.
    async fn finish(&self, project_id: &str, generation: u64) {
        let mut handles = self.handles.write().await;
        if !handles
            .get(project_id)
            .is_some_and(|h| h.generation == generation)
        {
            // Stopped explicitly or superseded by a newer launch.
            return;
        }
        handles.remove(project_id);
        match self.exit_policy {
            ExitPolicy::Retain => info!("{project_id} exited; route and console retained"),
            ExitPolicy::Release => {
                info!("{project_id} exited; releasing route and console");
                self.release(project_id).await;
            }
        }
    }

    async fn release(&self, project_id: &str) {
        self.registry.remove_route(project_id).await;
        self.console.close(project_id).await;
    }

    /// Kill the project's process group and release its route and console.
    /// A project with no handle is left untouched. Returns whether anything
    /// was stopped.
    pub async fn stop(&self, project_id: &str) -> bool {
        let mut handles = self.handles.write().await;
        let Some(handle) = handles.remove(project_id) else {
            debug!("Stop for {project_id}: nothing running");
            return false;
        };
        handle.terminate();
        self.release(project_id).await;
        drop(handles);
        info!("Stopped {project_id} (pid {})", handle.pid);
        true
    }

    /// Stop every project (used during shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} executions", ids.len());
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub async fn is_running(&self, project_id: &str) -> bool {
        self.handles
            .read()
            .await
            .get(project_id)
            .is_some_and(ExecutionHandle::is_alive)
    }

    pub async fn status(&self, project_id: &str) -> Option<ExecutionStatus> {
        self.handles
            .read()
            .await
            .get(project_id)
            .map(ExecutionHandle::status)
    }

    /// Status of every execution, ordered by project id.
    pub async fn list(&self) -> Vec<ExecutionStatus> {
        let mut all: Vec<ExecutionStatus> = self
            .handles
            .read()
            .await
            .values()
            .map(ExecutionHandle::status)
            .collect();
        all.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        all
    }

    /// Write `text` to the project's stdin, appending a newline if missing.
    pub async fn send_input(&self, project_id: &str, text: &str) -> Result<(), GatewayError> {
        let mut data = text.as_bytes().to_vec();
        if !text.ends_with('\n') {
            data.push(b'\n');
        }
        let stdin = self
            .handles
            .read()
            .await
            .get(project_id)
            .map(ExecutionHandle::stdin)
            .ok_or_else(|| GatewayError::NotRunning(project_id.to_string()))?;
        stdin.send(data).await.map_err(|_| GatewayError::InvalidState {
            project_id: project_id.to_string(),
            reason: "has closed its stdin".to_string(),
        })
    }

    /// Suspend the process group (SIGSTOP).
    pub async fn pause(&self, project_id: &str) -> Result<ExecutionStatus, GatewayError> {
        self.transition(project_id, RunState::Running, RunState::Paused, Signal::SIGSTOP)
            .await
    }

    /// Continue a paused process group (SIGCONT).
    pub async fn resume(&self, project_id: &str) -> Result<ExecutionStatus, GatewayError> {
        self.transition(project_id, RunState::Paused, RunState::Running, Signal::SIGCONT)
            .await
    }

    async fn transition(
        &self,
        project_id: &str,
        from: RunState,
        to: RunState,
        signal: Signal,
    ) -> Result<ExecutionStatus, GatewayError> {
        let mut handles = self.handles.write().await;
        let handle = handles
            .get_mut(project_id)
            .ok_or_else(|| GatewayError::NotRunning(project_id.to_string()))?;
        if handle.state != from {
            return Err(GatewayError::InvalidState {
                project_id: project_id.to_string(),
                reason: format!("is {:?}, expected {from:?}", handle.state).to_lowercase(),
            });
        }
        handle.signal(signal).map_err(|e| GatewayError::InvalidState {
            project_id: project_id.to_string(),
            reason: format!("could not be signalled: {e}"),
        })?;
        handle.state = to;
        info!("{project_id} is now {to:?}");
        Ok(handle.status())
    }
}
