use std::{
    process::Stdio,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
    time::{timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{adapters::ToolCommand, error::ExecutionError};

#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub hard_timeout: Duration,
    /// Logged only; the process keeps running.
    pub soft_timeout: Option<Duration>,
    /// Time between the polite termination signal and the kill.
    pub kill_grace: Duration,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            hard_timeout: Duration::from_secs(300),
            soft_timeout: None,
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Runs one external process per call and guarantees it has exited before
/// returning.
#[async_trait::async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &ToolCommand,
        limits: &ExecLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecutionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait::async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn execute(
        &self,
        command: &ToolCommand,
        limits: &ExecLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled {
                elapsed: Duration::ZERO,
            });
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(command = %command, "audit: launching external tool");
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut child = cmd.spawn().map_err(|e| ExecutionError::ToolUnavailable {
            path: command.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let mut stdout = capture(child.stdout.take());
        let mut stderr = capture(child.stderr.take());

        let deadline = tokio::time::Instant::now() + limits.hard_timeout;
        let soft = tokio::time::sleep(limits.soft_timeout.unwrap_or(limits.hard_timeout));
        let hard = tokio::time::sleep_until(deadline);
        tokio::pin!(soft, hard);
        let mut soft_pending = limits.soft_timeout.is_some();

        let waited = loop {
            tokio::select! {
                status = child.wait() => break Waited::Exited(status),
                _ = &mut soft, if soft_pending => {
                    soft_pending = false;
                    warn!(?pid, elapsed_secs = clock.elapsed().as_secs(), "soft timeout reached, scan still running");
                }
                _ = &mut hard => break Waited::TimedOut,
                _ = cancel.cancelled() => break Waited::Cancelled,
            }
        };

        match waited {
            Waited::Exited(Ok(status)) => {
                // descendants left in the group would hold the pipes open
                #[cfg(unix)]
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                let drained = timeout_at(deadline, async { tokio::join!(&mut stdout, &mut stderr) }).await;
                let Ok((stdout, stderr)) = drained else {
                    warn!(?pid, limit_secs = limits.hard_timeout.as_secs(), "tool output still open at hard timeout");
                    stdout.abort();
                    stderr.abort();
                    return Err(ExecutionError::Timeout {
                        elapsed: clock.elapsed(),
                        limit: limits.hard_timeout,
                    });
                };
                let stdout = stdout.unwrap_or_default();
                let stderr = stderr.unwrap_or_default();
                let elapsed = clock.elapsed();
                debug!(?pid, code = ?status.code(), elapsed_ms = elapsed.as_millis() as u64, "tool exited");
                if status.success() {
                    Ok(ExecOutput {
                        stdout,
                        stderr,
                        started_at,
                        elapsed,
                    })
                } else {
                    Err(ExecutionError::ToolFailure {
                        code: status.code(),
                        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                    })
                }
            }
            Waited::Exited(Err(e)) => {
                terminate(&mut child, limits.kill_grace).await;
                stdout.abort();
                stderr.abort();
                Err(ExecutionError::ToolFailure {
                    code: None,
                    stderr: format!("failed waiting for tool: {e}"),
                })
            }
            Waited::TimedOut => {
                warn!(?pid, limit_secs = limits.hard_timeout.as_secs(), "hard timeout reached, terminating tool");
                terminate(&mut child, limits.kill_grace).await;
                stdout.abort();
                stderr.abort();
                Err(ExecutionError::Timeout {
                    elapsed: clock.elapsed(),
                    limit: limits.hard_timeout,
                })
            }
            Waited::Cancelled => {
                info!(?pid, "cancellation requested, terminating tool");
                terminate(&mut child, limits.kill_grace).await;
                stdout.abort();
                stderr.abort();
                Err(ExecutionError::Cancelled {
                    elapsed: clock.elapsed(),
                })
            }
        }
    }
}

fn capture<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                warn!(error = %e, "failed reading tool output");
            }
        }
        buf
    })
}

/// The child leads its own process group, so its pid is the group id.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = %e, "failed to signal tool process group"),
    }
}

/// SIGTERM to the child's process group, then SIGKILL once `grace` runs
/// out. Returns only after the child has been reaped.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::SIGTERM);
        let exited = timeout(grace, child.wait()).await.is_ok();
        signal_group(pid, Signal::SIGKILL);
        if exited {
            return;
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill tool process");
    }
}

/// Runs the tool's version probe and returns the first line of its banner.
pub async fn probe_tool_version(
    executor: &dyn ProcessExecutor,
    command: &ToolCommand,
) -> Result<String, ExecutionError> {
    let limits = ExecLimits {
        hard_timeout: Duration::from_secs(5),
        soft_timeout: None,
        kill_grace: Duration::from_secs(1),
    };
    let out = executor
        .execute(command, &limits, &CancellationToken::new())
        .await?;
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}
