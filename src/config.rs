use std::path::PathBuf;
use std::time::Duration;

/// Default wait between the graceful interrupt and the forced kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Node-agent configuration consumed by the driver layer.
///
/// This is the slice of the agent's config that drivers read during
/// fingerprinting and when building per-task execution contexts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root directory under which per-task allocation directories live.
    pub alloc_dir: PathBuf,
    /// Grace period between the interrupt signal and the forced kill when
    /// stopping a task.
    pub kill_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            alloc_dir: PathBuf::from("/var/lib/taskdriver/alloc"),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ClientConfig {
    /// Build the execution context for one task's allocation directory.
    pub fn exec_context(&self, task_dir: impl Into<PathBuf>) -> ExecContext {
        ExecContext {
            alloc_dir: self.alloc_dir.join(task_dir.into()),
            kill_grace: self.kill_grace,
        }
    }
}

/// Per-task context handed to `start` and `open`.
///
/// Artifacts downloaded for the task land in `alloc_dir`; cleanup of that
/// directory after the task completes belongs to the allocation lifecycle
/// manager, not the driver.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub alloc_dir: PathBuf,
    pub kill_grace: Duration,
}

impl ExecContext {
    pub fn new(alloc_dir: impl Into<PathBuf>) -> Self {
        Self {
            alloc_dir: alloc_dir.into(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}
