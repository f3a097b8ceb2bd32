use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;

use taskdriver::config::ExecContext;
use taskdriver::driver::process_exists;
use taskdriver::driver::qemu::QemuDriver;
use taskdriver::error::DriverError;
use taskdriver::task::{Resources, Task};
use taskdriver::Driver;

const IMAGE_BYTES: &[u8] = b"pretend this is a machine image";

/// Serve IMAGE_BYTES at /image.qcow2 on an ephemeral port.
async fn serve_image() -> SocketAddr {
    let app = Router::new().route("/image.qcow2", get(|| async { IMAGE_BYTES }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn image_digest() -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(IMAGE_BYTES);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Write an executable shell script standing in for qemu-system-x86_64.
fn fake_qemu(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-qemu");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn vm_task(addr: SocketAddr) -> Task {
    Task::new("test-vm")
        .with_config("image_source", format!("http://{addr}/image.qcow2"))
        .with_resources(Resources {
            memory_mb: 512,
            ..Resources::default()
        })
}

/// Pull the PID and image path back out of a serialized handle id.
fn decode_handle(id: &str) -> (i32, String) {
    let payload = id.strip_prefix("QEMU:").expect("QEMU tag on handle id");
    let v: serde_json::Value = serde_json::from_str(payload).expect("valid JSON payload");
    (
        v["Pid"].as_i64().unwrap() as i32,
        v["VmID"].as_str().unwrap().to_string(),
    )
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn test_start_downloads_image_and_spawns_vm() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let args_path = dir.path().join("args.txt");
    let binary = fake_qemu(
        dir.path(),
        &format!(
            "printf '%s\\n' \"$@\" > {}\nexec sleep 30",
            args_path.display()
        ),
    );

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();

    // The handle id round-trips to the spawned process and the image path.
    let (pid, vm_path) = decode_handle(&handle.id());
    assert!(pid > 0);
    assert!(process_exists(pid));
    let vm_file = PathBuf::from(&vm_path);
    assert!(vm_file
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("qemu-vm-"));
    assert!(vm_path.ends_with("image.qcow2"));
    assert_eq!(std::fs::read(&vm_file).unwrap(), IMAGE_BYTES);

    // The invocation carried the memory ceiling and the downloaded image.
    wait_until(|| args_path.exists()).await;
    let args = std::fs::read_to_string(&args_path).unwrap();
    let lines: Vec<&str> = args.lines().collect();
    assert!(lines.contains(&"-m"));
    assert!(lines.contains(&"512M"));
    assert!(lines.contains(&format!("file={vm_path}").as_str()));

    handle.kill().await.unwrap();
}

#[tokio::test]
async fn test_start_verifies_supplied_checksum() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "exec sleep 30");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let task = vm_task(addr).with_config("checksum", image_digest());

    let mut handle = driver.start(&ctx, &task).await.unwrap();
    handle.kill().await.unwrap();
}

#[tokio::test]
async fn test_start_checksum_mismatch_never_spawns() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let binary = fake_qemu(dir.path(), &format!("touch {}", marker.display()));

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let task = vm_task(addr).with_config("checksum", "b".repeat(64));

    let err = driver.start(&ctx, &task).await.unwrap_err();
    assert!(matches!(err, DriverError::Integrity { .. }));
    assert!(!marker.exists(), "backend must not have been spawned");

    // The untrusted artifact was removed from the allocation dir.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("qemu-vm-"))
        .collect();
    assert!(leftovers.is_empty(), "artifact left behind: {leftovers:?}");
}

#[tokio::test]
async fn test_start_requires_image_source() {
    let dir = tempfile::tempdir().unwrap();
    let driver = QemuDriver::with_binary("/bin/false");
    let ctx = ExecContext::new(dir.path());
    let task = Task::new("no-image").with_resources(Resources {
        memory_mb: 512,
        ..Resources::default()
    });

    let err = driver.start(&ctx, &task).await.unwrap_err();
    assert!(matches!(err, DriverError::Configuration(_)));
}

#[tokio::test]
async fn test_start_requires_memory_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let driver = QemuDriver::with_binary("/bin/false");
    let ctx = ExecContext::new(dir.path());
    // Port 1 is never listening; a fetch attempt would fail as Fetch, so a
    // Resource error proves validation ran first.
    let task = Task::new("no-memory").with_config("image_source", "http://127.0.0.1:1/img.qcow2");

    let err = driver.start(&ctx, &task).await.unwrap_err();
    assert!(matches!(err, DriverError::Resource(_)));
}

#[tokio::test]
async fn test_start_spawn_failure_reports_program() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("not-a-qemu");

    let driver = QemuDriver::with_binary(missing.display().to_string());
    let ctx = ExecContext::new(dir.path());

    let err = driver.start(&ctx, &vm_task(addr)).await.unwrap_err();
    match err {
        DriverError::Spawn { program, .. } => assert!(program.contains("not-a-qemu")),
        other => panic!("expected Spawn error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clean_exit_closes_wait_channel_without_value() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "exit 0");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();

    assert!(handle.wait_ch().recv().await.is_none());
    // Closed stays closed.
    assert!(handle.wait_ch().recv().await.is_none());
}

#[tokio::test]
async fn test_abnormal_exit_surfaces_once_with_stderr() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "echo disk on fire >&2\nexit 7");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();

    let err = handle.wait_ch().recv().await.expect("abnormal exit");
    let msg = err.to_string();
    assert!(msg.contains("exit code 7"), "unexpected message: {msg}");
    assert!(msg.contains("disk on fire"), "stderr missing: {msg}");
    assert!(handle.wait_ch().recv().await.is_none());
}

#[tokio::test]
async fn test_kill_returns_promptly_when_vm_obliges() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "exec sleep 30");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();

    let started = Instant::now();
    handle.kill().await.unwrap();
    // Well inside the 5s default grace: no forced kill was needed.
    assert!(started.elapsed() < Duration::from_secs(2));

    // Interrupt death is an abnormal exit, delivered exactly once.
    assert!(handle.wait_ch().recv().await.is_some());
    assert!(handle.wait_ch().recv().await.is_none());
}

#[tokio::test]
async fn test_kill_escalates_after_grace_period() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "trap '' INT TERM\nwhile :; do sleep 1; done");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let grace = Duration::from_millis(300);
    let ctx = ExecContext::new(dir.path()).with_kill_grace(grace);
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();
    let (pid, _) = decode_handle(&handle.id());

    let started = Instant::now();
    handle.kill().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "kill returned before the grace period");
    assert!(elapsed < Duration::from_secs(5));
    assert!(!process_exists(pid), "process survived the forced kill");
}

#[tokio::test]
async fn test_open_reattaches_to_running_vm() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "exec sleep 30");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();
    let id = handle.id();
    // Simulate the agent restart losing its in-memory handle.
    drop(handle);

    let mut reattached = driver.open(&ctx, &id).await.unwrap();
    assert_eq!(reattached.id(), id);
    reattached.kill().await.unwrap();
}

#[tokio::test]
async fn test_open_missing_process_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let driver = QemuDriver::with_binary("/bin/false");
    let ctx = ExecContext::new(dir.path());

    let id = r#"QEMU:{"Pid":999999999,"VmID":"/tmp/image"}"#;
    let err = driver.open(&ctx, id).await.unwrap_err();
    assert!(matches!(err, DriverError::ProcessNotFound(999_999_999)));
}

#[tokio::test]
async fn test_open_rejects_foreign_and_malformed_ids() {
    let dir = tempfile::tempdir().unwrap();
    let driver = QemuDriver::with_binary("/bin/false");
    let ctx = ExecContext::new(dir.path());

    let err = driver
        .open(&ctx, r#"DOCKER:{"Pid":1,"VmID":"x"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::HandleDecode { .. }));

    let err = driver.open(&ctx, "QEMU:garbage").await.unwrap_err();
    assert!(matches!(err, DriverError::HandleDecode { .. }));
}

#[tokio::test]
async fn test_update_is_a_supported_no_op() {
    let addr = serve_image().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_qemu(dir.path(), "exec sleep 30");

    let driver = QemuDriver::with_binary(binary.display().to_string());
    let ctx = ExecContext::new(dir.path());
    let mut handle = driver.start(&ctx, &vm_task(addr)).await.unwrap();

    handle.update(&vm_task(addr)).unwrap();
    handle.kill().await.unwrap();
}
