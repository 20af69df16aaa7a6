//! External process execution with line-streamed output.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stampede_shared::deployment::{DeploymentRequest, JobOutput, StreamType};

use crate::runner::JobEvents;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn {script}: {source}")]
    Spawn {
        script: String,
        source: std::io::Error,
    },

    #[error("failed to capture process output pipes")]
    MissingPipe,

    #[error("waiting for process failed: {0}")]
    Wait(std::io::Error),
}

/// How a finished process is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit code 0.
    Success,
    /// The sentinel exit code, or a signal death after a stop request.
    Cancelled,
    /// Any other exit; carries the code, or -1 for an unrequested signal
    /// death.
    Failed(i32),
}

/// Seam between the runner's lifecycle logic and real process execution.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: &DeploymentRequest,
        cancel: CancellationToken,
        events: Arc<dyn JobEvents>,
    ) -> Result<ExitDisposition, ExecError>;
}

/// Runs one fixed executable per deployment kind, with the request's
/// parameters injected as uppercase environment variables.
pub struct CommandRunner {
    script_dir: PathBuf,
    cancel_exit_code: i32,
}

impl CommandRunner {
    pub fn new(script_dir: PathBuf, cancel_exit_code: i32) -> Self {
        Self {
            script_dir,
            cancel_exit_code,
        }
    }
}

#[async_trait]
impl Executor for CommandRunner {
    async fn execute(
        &self,
        request: &DeploymentRequest,
        cancel: CancellationToken,
        events: Arc<dyn JobEvents>,
    ) -> Result<ExitDisposition, ExecError> {
        let script = self.script_dir.join(request.deployment_type.script_name());

        let mut command = Command::new(&script);
        for (key, value) in &request.params {
            command.env(key.to_uppercase(), value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(id = %request.id, script = %script.display(), "spawning");
        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            script: script.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(ExecError::MissingPipe)?;
        let stderr = child.stderr.take().ok_or(ExecError::MissingPipe)?;

        let stdout_task = tokio::spawn(stream_lines(
            stdout,
            StreamType::Stdout,
            request.clone(),
            Arc::clone(&events),
        ));
        let stderr_task = tokio::spawn(stream_lines(
            stderr,
            StreamType::Stderr,
            request.clone(),
            Arc::clone(&events),
        ));

        let pid = child.id();
        let mut signalled = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(ExecError::Wait)?,
                _ = cancel.cancelled(), if !signalled => {
                    signalled = true;
                    if let Some(pid) = pid {
                        debug!(id = %request.id, pid, "sending SIGTERM");
                        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                            warn!(id = %request.id, pid, error = %e, "SIGTERM delivery failed");
                        }
                    }
                }
            }
        };

        // Drain both pipes before the caller publishes the done marker.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        Ok(classify_exit(status, self.cancel_exit_code, signalled))
    }
}

async fn stream_lines<R>(
    pipe: R,
    stream_type: StreamType,
    request: DeploymentRequest,
    events: Arc<dyn JobEvents>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(pipe, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(text) => {
                let output =
                    JobOutput::line(&request.id, request.deployment_type, stream_type, text);
                if let Err(e) = events.output(&output).await {
                    warn!(id = %request.id, error = %e, "failed to publish output line");
                }
            }
            Err(e) => {
                warn!(id = %request.id, error = %e, "output stream read failed");
                break;
            }
        }
    }
}

fn classify_exit(status: ExitStatus, cancel_exit_code: i32, cancel_requested: bool) -> ExitDisposition {
    match status.code() {
        Some(0) => ExitDisposition::Success,
        Some(code) if code == cancel_exit_code => ExitDisposition::Cancelled,
        Some(code) => ExitDisposition::Failed(code),
        // Killed by a signal. Expected after our own SIGTERM; anything else
        // is a failure.
        None if cancel_requested => ExitDisposition::Cancelled,
        None => ExitDisposition::Failed(-1),
    }
}
