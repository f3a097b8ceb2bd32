//! QEMU virtual machine backend.
//!
//! Downloads a machine image into the task's allocation directory and boots
//! it headless under `qemu-system-x86_64`, with sane defaults and a small
//! set of knobs read from the task config:
//!
//! - `image_source` (required): HTTP(S) URL of the machine image
//! - `checksum` (optional): SHA-256 hex digest to verify the image against
//! - `accelerator` (optional): `tcg` (default, software emulation) or `kvm`
//! - `guest_port` / `host_port` (optional, paired): TCP port forward from
//!   the host into the guest
//!
//! QEMU's own default of 128M RAM per VM is refused: tasks must carry an
//! explicit memory resource.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ExecContext};
use crate::error::{DriverError, Result};
use crate::fetcher::{unique_artifact_name, ArtifactFetcher};
use crate::node::Node;
use crate::task::Task;

use super::process::{self, supervise, SupervisedProcess, Supervision};
use super::{Driver, DriverHandle};

/// Executable probed and spawned by default.
const QEMU_BINARY: &str = "qemu-system-x86_64";

/// Tag prefixing serialized handle ids.
const HANDLE_TAG: &str = "QEMU";

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"QEMU emulator version ([\d.]+)").expect("version regex is valid")
});

/// Driver for running machine images under QEMU.
#[derive(Debug)]
pub struct QemuDriver {
    binary: String,
    fetcher: ArtifactFetcher,
}

impl QemuDriver {
    pub fn new() -> Self {
        Self::with_binary(QEMU_BINARY)
    }

    /// Use a different emulator binary, for non-standard install locations
    /// and for exercising the driver without a real QEMU in tests.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            fetcher: ArtifactFetcher::new(),
        }
    }
}

impl Default for QemuDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn tag(&self) -> &'static str {
        HANDLE_TAG
    }

    async fn fingerprint(&self, _config: &ClientConfig, node: &Node) -> Result<bool> {
        // QEMU needs root for KVM and network setup. Lack of privilege is an
        // ordinary unavailable outcome, not a malfunction.
        if !nix::unistd::geteuid().is_root() {
            tracing::debug!(driver = self.name(), "must run as root, disabling");
            return Ok(false);
        }

        let output = match Command::new(&self.binary).arg("-version").output().await {
            Ok(output) if output.status.success() => output,
            // Tool missing or refusing to run: unavailable, not broken.
            _ => return Ok(false),
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim();
        // A version banner we cannot parse means an installation unlike any
        // we support; surface it instead of reporting "not installed".
        let version = VERSION_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                DriverError::Fingerprint(format!("unable to parse QEMU version from {:?}", text))
            })?;

        node.set_attribute("driver.qemu", "true");
        node.set_attribute("driver.qemu.version", &version);
        tracing::info!(driver = self.name(), version = %version, "qemu available");
        Ok(true)
    }

    async fn start(&self, ctx: &ExecContext, task: &Task) -> Result<Box<dyn DriverHandle>> {
        task.validate()?;
        let source = task.config_value("image_source").ok_or_else(|| {
            DriverError::Configuration("missing image_source for qemu task".to_string())
        })?;

        // QEMU would happily default to 128M; force tasks to say what they
        // need before anything is downloaded.
        let memory_mb = task.resources.as_ref().map_or(0, |r| r.memory_mb);
        if memory_mb == 0 {
            return Err(DriverError::Resource("memory".to_string()));
        }

        let vm_id = unique_artifact_name("qemu-vm", source);
        let vm_path = ctx.alloc_dir.join(&vm_id);
        tracing::debug!(task = %task.name, source, path = %vm_path.display(), "downloading image");
        self.fetcher.download(source, &vm_path).await?;

        if let Some(expected) = task.config_value("checksum") {
            tracing::debug!(task = %task.name, vm_id = %vm_id, "verifying image checksum");
            self.fetcher.verify_checksum(&vm_path, expected).await?;
        }

        let args = build_args(task, memory_mb, &vm_id, &vm_path)?;
        tracing::debug!(task = %task.name, binary = %self.binary, ?args, "starting VM");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The VM must outlive an agent restart.
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| DriverError::Spawn {
                program: self.binary.clone(),
                reason: e.to_string(),
            })?;
        let proc = SupervisedProcess::from_child(child)?;

        tracing::info!(task = %task.name, pid = proc.pid(), vm_id = %vm_id, "started VM");
        Ok(Box::new(QemuHandle::new(proc, vm_path, ctx.kill_grace)))
    }

    async fn open(&self, ctx: &ExecContext, handle_id: &str) -> Result<Box<dyn DriverHandle>> {
        let decoded = QemuHandleId::decode(handle_id)?;
        let proc = SupervisedProcess::reattach(decoded.pid)?;

        tracing::info!(pid = decoded.pid, vm_path = %decoded.vm_id, "reattached to VM");
        Ok(Box::new(QemuHandle::new(
            proc,
            PathBuf::from(decoded.vm_id),
            ctx.kill_grace,
        )))
    }
}

/// Translate the task's resources and config into the QEMU invocation.
fn build_args(task: &Task, memory_mb: u64, vm_id: &str, vm_path: &Path) -> Result<Vec<String>> {
    let accelerator = task.config_value("accelerator").unwrap_or("tcg");

    let mut args = vec![
        "-machine".to_string(),
        format!("type=pc,accel={accelerator}"),
        "-name".to_string(),
        vm_id.to_string(),
        "-m".to_string(),
        format!("{memory_mb}M"),
        "-drive".to_string(),
        format!("file={}", vm_path.display()),
        "-nodefconfig".to_string(),
        "-nodefaults".to_string(),
        "-nographic".to_string(),
    ];

    // Forward a host port into the guest when both ends are given. The host
    // port must already be free; nothing here reserves it.
    match (task.config_value("guest_port"), task.config_value("host_port")) {
        (Some(guest), Some(host)) => {
            let guest: u16 = guest.parse().map_err(|_| {
                DriverError::Configuration(format!("invalid guest_port {:?}", guest))
            })?;
            let host: u16 = host
                .parse()
                .map_err(|_| DriverError::Configuration(format!("invalid host_port {:?}", host)))?;
            args.push("-netdev".to_string());
            args.push(format!("user,id=user.0,hostfwd=tcp::{host}-:{guest}"));
            args.push("-device".to_string());
            args.push("virtio-net,netdev=user.0".to_string());
        }
        (None, None) => {}
        _ => {
            return Err(DriverError::Configuration(
                "guest_port and host_port must be set together".to_string(),
            ));
        }
    }

    if accelerator == "kvm" {
        args.push("-enable-kvm".to_string());
        args.push("-cpu".to_string());
        args.push("host".to_string());
    }

    Ok(args)
}

/// Wire form of a QEMU handle id: `QEMU:{"Pid":1234,"VmID":"/path/to/image"}`.
///
/// Field names are part of the persisted format; do not rename.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct QemuHandleId {
    #[serde(rename = "Pid")]
    pid: i32,
    #[serde(rename = "VmID")]
    vm_id: String,
}

impl QemuHandleId {
    fn encode(&self) -> String {
        // Serialization of two plain fields cannot fail.
        let payload = serde_json::to_string(self).expect("handle id serializes");
        format!("{HANDLE_TAG}:{payload}")
    }

    /// Decode is all-or-nothing: wrong tag or malformed payload yields an
    /// error and never a partially filled id.
    fn decode(handle_id: &str) -> Result<Self> {
        let payload = handle_id
            .strip_prefix(HANDLE_TAG)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| DriverError::HandleDecode {
                handle_id: handle_id.to_string(),
                reason: format!("missing {HANDLE_TAG:?} tag"),
            })?;
        serde_json::from_str(payload).map_err(|e| DriverError::HandleDecode {
            handle_id: handle_id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Supervision handle for one QEMU VM. The supervision task owns the
/// process; the handle keeps only its PID, the image path, and the channel
/// ends of the supervision wiring.
#[derive(Debug)]
pub struct QemuHandle {
    pid: i32,
    vm_path: PathBuf,
    kill_grace: Duration,
    wait_rx: mpsc::Receiver<DriverError>,
    done: CancellationToken,
}

impl QemuHandle {
    fn new(proc: SupervisedProcess, vm_path: PathBuf, kill_grace: Duration) -> Self {
        let pid = proc.pid();
        let Supervision { wait_rx, done } = supervise(proc);
        Self {
            pid,
            vm_path,
            kill_grace,
            wait_rx,
            done,
        }
    }
}

#[async_trait]
impl DriverHandle for QemuHandle {
    fn id(&self) -> String {
        QemuHandleId {
            pid: self.pid,
            vm_id: self.vm_path.display().to_string(),
        }
        .encode()
    }

    fn wait_ch(&mut self) -> &mut mpsc::Receiver<DriverError> {
        &mut self.wait_rx
    }

    async fn kill(&mut self) -> Result<()> {
        process::interrupt(self.pid)?;
        tokio::select! {
            _ = self.done.cancelled() => {
                tracing::debug!(pid = self.pid, "VM exited within grace period");
                Ok(())
            }
            _ = tokio::time::sleep(self.kill_grace) => {
                tracing::warn!(pid = self.pid, "grace period expired, force killing VM");
                process::force_kill(self.pid)?;
                // Do not return until supervision has seen the process die.
                self.done.cancelled().await;
                Ok(())
            }
        }
    }

    fn update(&self, _task: &Task) -> Result<()> {
        // A running VM cannot be reconfigured in place.
        Ok(())
    }
}
