//! Driver abstraction shared by every execution backend.
//!
//! A driver turns a placed task into a running backend process and hands the
//! agent an opaque [`DriverHandle`] to supervise it. Handles serialize to a
//! backend-tagged string the agent persists across its own restarts; feeding
//! that string back through [`Driver::open`] reattaches to the still-running
//! task.
//!
//! # Lifecycle
//!
//! 1. `fingerprint` once per backend at agent startup (and periodically)
//! 2. `start(ctx, task)` on placement, returning a handle
//! 3. persist `handle.id()`
//! 4. after an agent restart, `open(ctx, persisted_id)` to resume
//! 5. block on `wait_ch()` for completion, `kill()` on a stop request

pub mod process;
pub mod qemu;
pub mod registry;

pub use process::{process_exists, SupervisedProcess};
pub use registry::DriverRegistry;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ClientConfig, ExecContext};
use crate::error::{DriverError, Result};
use crate::node::Node;
use crate::task::Task;

/// One execution backend (VM monitor, container runtime, raw process, ...).
///
/// Implementations own backend-specific argument construction; the agent
/// talks to them only through this trait and dispatches by name through the
/// [`DriverRegistry`], never by downcasting.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Stable backend name, used for registry dispatch and as the
    /// `driver.<name>` node-attribute prefix.
    fn name(&self) -> &'static str;

    /// Tag prefixing this backend's serialized handle ids. Decoding an id
    /// carrying another backend's tag must always fail.
    fn tag(&self) -> &'static str;

    /// Probe whether this node can run the backend at all.
    ///
    /// Ordinary "unavailable" outcomes (missing privilege, tooling not
    /// installed) are `Ok(false)` with no attributes written; `Err` is
    /// reserved for a backend that is present but broken, so operators can
    /// tell a broken installation from an absent one. Idempotent and safe
    /// to re-run periodically.
    async fn fingerprint(&self, config: &ClientConfig, node: &Node) -> Result<bool>;

    /// Launch a task and return its supervision handle.
    ///
    /// Blocks on artifact transfer; callers are expected to invoke it from
    /// a context that tolerates network-bound work. Errors are terminal for
    /// the attempt, with no partial side effects before validation passes.
    async fn start(&self, ctx: &ExecContext, task: &Task) -> Result<Box<dyn DriverHandle>>;

    /// Reattach to a task started before an agent restart.
    ///
    /// A handle produced by `open` is identical in shape to one produced by
    /// `start`, including its single supervision task.
    async fn open(&self, ctx: &ExecContext, handle_id: &str) -> Result<Box<dyn DriverHandle>>;
}

/// Supervision handle for one live (or reattached) task.
///
/// Exactly one supervision task runs per handle. The underlying OS process
/// is exclusively owned by its handle; two handles must never reference the
/// same process.
#[async_trait]
pub trait DriverHandle: Send + std::fmt::Debug {
    /// Opaque identity for this task, safe to persist as plain text and
    /// feed back to the owning driver's `open` after an agent restart.
    fn id(&self) -> String;

    /// Completion channel: yields at most one error (abnormal exit) and
    /// then closes; a clean exit closes it without a value. Block on it to
    /// learn of completion; never poll.
    fn wait_ch(&mut self) -> &mut mpsc::Receiver<DriverError>;

    /// Graceful stop: interrupt, wait out the grace period, then force-kill
    /// and confirm termination. Always returns within the grace period plus
    /// the forced-kill round trip. The exclusive borrow keeps concurrent
    /// kills from racing each other.
    async fn kill(&mut self) -> Result<()>;

    /// Apply an updated task definition to the running task. Backends that
    /// cannot reconfigure a live task return `Ok(())` without doing
    /// anything.
    fn update(&self, task: &Task) -> Result<()>;
}
