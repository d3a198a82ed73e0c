//! Child-process supervision with a hard deadline.
//!
//! The one genuine wait-with-timeout in the pipeline: the child is raced
//! against the deadline and the cancellation token, and on either of those
//! it is killed and reaped before `supervise` returns.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the pipes may stay open after the child exits. A background
/// grandchild can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited {
        /// `-1` when the child was terminated by a signal.
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut {
        pid: Option<u32>,
    },
    Cancelled {
        pid: Option<u32>,
    },
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Deadline,
    Cancelled,
}

/// Read `pipe` to EOF, or until `stop` fires and nothing more is buffered.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, stop: CancellationToken) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut pipe) = pipe else {
        return buf;
    };
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            read = pipe.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("pipe read ended early: {}", e);
                    break;
                }
            },
            _ = stop.cancelled() => {
                debug!("pipe still open after child exit, keeping output read so far");
                break;
            }
        }
    }
    buf
}

async fn terminate(child: &mut Child) {
    // `kill` sends SIGKILL and waits, so the child is reaped on return.
    if let Err(e) = child.kill().await {
        warn!("failed to kill supervised process: {}", e);
    }
}

/// Spawn `command` and wait for it, at most `timeout`.
///
/// stdout and stderr are drained concurrently into memory and returned in
/// full. Spawn failures are returned as `Err`; everything after a successful
/// spawn is a `ProcessOutcome`.
pub async fn supervise(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<ProcessOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();
    let deadline = Instant::now() + timeout;
    debug!(?pid, timeout_secs = timeout.as_secs_f64(), "supervising child");

    let stop_draining = CancellationToken::new();
    let stdout_task = tokio::spawn(drain(child.stdout.take(), stop_draining.clone()));
    let stderr_task = tokio::spawn(drain(child.stderr.take(), stop_draining.clone()));

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Waited::Deadline,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(status) => {
            let status = status?;
            // Never past the deadline, and never longer than the grace period.
            let stop_at = (Instant::now() + DRAIN_GRACE).min(deadline);
            let stopper = stop_draining.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(stop_at).await;
                stopper.cancel();
            });
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            timer.abort();
            Ok(ProcessOutcome::Exited {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        }
        Waited::Deadline => {
            terminate(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            Ok(ProcessOutcome::TimedOut { pid })
        }
        Waited::Cancelled => {
            terminate(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            Ok(ProcessOutcome::Cancelled { pid })
        }
    }
}
