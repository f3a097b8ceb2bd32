//! Supervised-process primitives shared by all backends.
//!
//! A task's backend process is either a child we spawned (exit status
//! observable through `wait`) or a detached PID reattached after an agent
//! restart. Detached processes cannot be waited on, so their supervision
//! polls for liveness instead; disappearance closes the completion channel
//! without a value since the real exit status is unknowable.

use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DriverError, Result};

/// How often a reattached (non-child) process is probed for liveness.
const REATTACH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Most stderr bytes retained for an abnormal-exit report. Ongoing log
/// streaming is not this layer's concern; this buffer exists only so spawn
/// and exit failures carry something diagnosable.
const STDERR_CAP: usize = 16 * 1024;

/// A backend process exclusively owned by one handle.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: i32,
    inner: ProcessInner,
}

#[derive(Debug)]
enum ProcessInner {
    Spawned(Child),
    Reattached,
}

impl SupervisedProcess {
    /// Wrap a freshly spawned child.
    pub fn from_child(child: Child) -> Result<Self> {
        let pid = child.id().ok_or_else(|| DriverError::Spawn {
            program: "<child>".to_string(),
            reason: "process exited before its pid could be read".to_string(),
        })? as i32;
        Ok(Self {
            pid,
            inner: ProcessInner::Spawned(child),
        })
    }

    /// Pick up a process started before an agent restart.
    ///
    /// The PID is probed for existence first; a PID that has already exited
    /// (or been recycled past our reach) is reported as not found so the
    /// caller can mark the task lost. PID reuse by an unrelated process is
    /// an inherent, accepted race.
    pub fn reattach(pid: i32) -> Result<Self> {
        if !process_exists(pid) {
            return Err(DriverError::ProcessNotFound(pid));
        }
        Ok(Self {
            pid,
            inner: ProcessInner::Reattached,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Block until the process is gone.
    ///
    /// Returns `None` for a clean exit and a `Wait` error (with any captured
    /// stderr) for an abnormal one. Reattached processes always report
    /// `None`: only liveness is observable for a non-child.
    async fn wait(&mut self) -> Option<DriverError> {
        match &mut self.inner {
            ProcessInner::Spawned(child) => {
                // Drain both pipes so the child never blocks on a full pipe;
                // keep a bounded stderr tail for the exit report.
                let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, 0)));
                let stderr_task = child
                    .stderr
                    .take()
                    .map(|s| tokio::spawn(read_capped(s, STDERR_CAP)));

                let status = match child.wait().await {
                    Ok(status) => status,
                    Err(e) => return Some(DriverError::Wait(format!("wait failed: {e}"))),
                };
                if let Some(task) = stdout_task {
                    let _ = task.await;
                }
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };

                if status.success() {
                    None
                } else {
                    Some(DriverError::Wait(describe_exit(status, &stderr)))
                }
            }
            ProcessInner::Reattached => {
                let pid = self.pid;
                loop {
                    if !process_exists(pid) {
                        return None;
                    }
                    tokio::time::sleep(REATTACH_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// Wiring produced when supervision starts: the single-consumer completion
/// channel and the done token `kill` races against its grace timer.
pub struct Supervision {
    /// Yields at most one error (abnormal exit) and then closes; a clean
    /// exit closes it without a value.
    pub wait_rx: mpsc::Receiver<DriverError>,
    /// Cancelled exactly once when the process is gone, whether it exited
    /// naturally or was killed.
    pub done: CancellationToken,
}

/// Start the supervision task for `proc`. Exactly one supervision task runs
/// per handle; it owns the process for the handle's whole lifetime.
pub fn supervise(mut proc: SupervisedProcess) -> Supervision {
    let (tx, wait_rx) = mpsc::channel(1);
    let done = CancellationToken::new();
    let done_signal = done.clone();

    tokio::spawn(async move {
        let pid = proc.pid();
        let outcome = proc.wait().await;
        done_signal.cancel();
        match outcome {
            None => tracing::debug!(pid, "process exited cleanly"),
            Some(err) => {
                tracing::debug!(pid, error = %err, "process exited abnormally");
                let _ = tx.send(err).await;
            }
        }
        // Dropping the sender closes the completion channel.
    });

    Supervision { wait_rx, done }
}

/// Probe a PID for existence without delivering a signal.
pub fn process_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Alive but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Deliver the graceful interrupt. A process that already exited is fine;
/// the caller's done token covers that race.
pub fn interrupt(pid: i32) -> Result<()> {
    send(pid, Signal::SIGINT)
}

/// Unconditional termination, used after the grace period expires.
pub fn force_kill(pid: i32) -> Result<()> {
    send(pid, Signal::SIGKILL)
}

fn send(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(DriverError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Read a pipe to EOF, retaining at most `cap` bytes.
async fn read_capped<R: AsyncReadExt + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

fn describe_exit(status: std::process::ExitStatus, stderr: &str) -> String {
    let mut msg = match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "unknown exit status".to_string(),
    };
    if !stderr.is_empty() {
        msg.push_str(&format!("; stderr: {stderr}"));
    }
    msg
}
