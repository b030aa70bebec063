//! Process-level scenarios for the bucketfs binary.
//!
//! Mount scenarios require a working FUSE installation (macFUSE, FUSE-T, or
//! libfuse) and are ignored by default. They mount an in-memory bucket
//! (`memory://`), so no network is needed. Run with:
//!
//!     cargo test --test scenarios -- --ignored --test-threads=1

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `bucketfs <args>` to completion.
fn bucketfs(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bucketfs"))
        .args(args)
        .output()
        .expect("failed to run bucketfs")
}

/// Save an in-memory bucket mount at `mountpoint` into `config`.
fn add_memory_mount(config: &Path, mountpoint: &Path, bucket: &str) {
    let output = bucketfs(&[
        "add",
        mountpoint.to_str().unwrap(),
        bucket,
        "--satellite",
        "memory://",
        "--api-key",
        "test-key",
        "--passphrase",
        "test-passphrase",
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "bucketfs add failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
}

/// A running `bucketfs mount` process with helpers for inspecting and
/// controlling it.
struct BucketMount {
    child: Child,
    _workdir: TempDir,
    mountpoint: PathBuf,
    stderr_lines: Arc<Mutex<Vec<String>>>,
    _stderr_thread: Option<std::thread::JoinHandle<()>>,
}

impl BucketMount {
    /// Save one in-memory bucket in a fresh config and mount it.
    fn start() -> Self {
        let workdir = tempfile::tempdir().expect("create workdir");
        let mountpoint = workdir.path().join("mnt");
        let config = workdir.path().join("mounts.json");
        add_memory_mount(&config, &mountpoint, "scratch");

        let log_file = workdir.path().join("bucketfs-test.log");

        let mut child = Command::new(env!("CARGO_BIN_EXE_bucketfs"))
            .args([
                "mount",
                "--config",
                config.to_str().unwrap(),
                "--log-file",
                log_file.to_str().unwrap(),
            ])
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn bucketfs mount");

        let stderr = child.stderr.take().unwrap();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();

        let thread = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                lines_clone.lock().unwrap().push(line);
            }
        });

        Self {
            child,
            _workdir: workdir,
            mountpoint,
            stderr_lines: lines,
            _stderr_thread: Some(thread),
        }
    }

    fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn pid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    /// Block until the mountpoint appears in `mount` output, or panic on timeout.
    fn wait_for_mount(&self, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if is_mounted(self.mountpoint()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!(
            "bucketfs mount did not appear at {:?} within {:?}\nstderr so far:\n{}",
            self.mountpoint(),
            timeout,
            self.stderr_snapshot().join("\n"),
        );
    }

    fn send_signal(&self, sig: libc::c_int) {
        unsafe {
            libc::kill(self.pid(), sig);
        }
    }

    /// Poll `try_wait` until the process exits or timeout elapses.
    fn wait_with_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        loop {
            match self.child.try_wait().expect("try_wait failed") {
                Some(status) => return Some(status),
                None if start.elapsed() >= timeout => return None,
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn is_running(&mut self) -> bool {
        self.child.try_wait().expect("try_wait failed").is_none()
    }

    fn stderr_snapshot(&self) -> Vec<String> {
        self.stderr_lines.lock().unwrap().clone()
    }

    fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr_lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains(pattern))
    }

    /// Poll stderr until a line containing `pattern` appears, or timeout.
    fn wait_for_stderr(&self, pattern: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.stderr_contains(pattern) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for BucketMount {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            unsafe {
                libc::kill(self.pid(), libc::SIGKILL);
            }
            let _ = self.child.wait();
        }
        // Force-unmount if still mounted so the workdir can be cleaned up.
        if is_mounted(self.mountpoint()) {
            let _ = Command::new("umount")
                .args(["-f", self.mountpoint().to_str().unwrap()])
                .status();
        }
    }
}

/// Check whether `path` appears in the output of the `mount` command.
fn is_mounted(path: &Path) -> bool {
    let output = Command::new("mount")
        .output()
        .expect("failed to run mount");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    stdout
        .lines()
        .any(|line| line.contains(path_str.as_ref()))
}

/// Block until `path` is no longer mounted, or panic on timeout.
fn wait_until_unmounted(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_mounted(path) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("{:?} still mounted after {:?}", path, timeout);
}

/// Block until `path` reads back as `expected`. close(2) returns before the
/// kernel releases the handle that commits the upload.
fn wait_for_contents(path: &Path, expected: &[u8], timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if std::fs::read(path).ok().as_deref() == Some(expected) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("{:?} never read back as {:?}", path, String::from_utf8_lossy(expected));
}

/// Spawn a `sleep` process whose cwd is inside the mountpoint, making the
/// mount busy from the kernel's perspective.
fn hold_busy(mountpoint: &Path) -> Child {
    Command::new("sleep")
        .arg("3600")
        .current_dir(mountpoint)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn busy-holder")
}

fn kill_child(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGKILL);
    }
    let _ = child.wait();
}

// ---------------------------------------------------------------------------
// Saved mounts (no FUSE needed)
// ---------------------------------------------------------------------------

#[test]
fn saved_mounts_add_list_remove() {
    let workdir = tempfile::tempdir().unwrap();
    let config = workdir.path().join("mounts.json");
    let mountpoint = workdir.path().join("photos");
    add_memory_mount(&config, &mountpoint, "photos");

    let output = bucketfs(&["list", "--config", config.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("photos\tmemory://"), "unexpected list output: {}", stdout);
    assert!(!stdout.contains("test-passphrase"), "list leaked a secret: {}", stdout);

    let output = bucketfs(&[
        "remove",
        mountpoint.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let output = bucketfs(&["list", "--config", config.to_str().unwrap()]);
    assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
}

#[test]
fn add_requires_credentials() {
    let workdir = tempfile::tempdir().unwrap();
    let config = workdir.path().join("mounts.json");
    let output = bucketfs(&[
        "add",
        workdir.path().join("mnt").to_str().unwrap(),
        "photos",
        "--satellite",
        "memory://",
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(!config.exists());
}

#[test]
fn mount_without_saved_mounts_exits_with_error() {
    let workdir = tempfile::tempdir().unwrap();
    let config = workdir.path().join("mounts.json");
    let log_file = workdir.path().join("bucketfs.log");
    let output = bucketfs(&[
        "mount",
        "--config",
        config.to_str().unwrap(),
        "--log-file",
        log_file.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No mounts configured"));
}

// ---------------------------------------------------------------------------
// Mount scenarios
// ---------------------------------------------------------------------------

/// Scenario 1: ctrl-C when the mount is not busy.
///
/// Expected: bucketfs unmounts promptly, prints shutdown messages, exits 0.
#[test]
#[ignore]
fn scenario_01_ctrl_c_not_busy() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));

    mount.send_signal(libc::SIGINT);

    let status = mount
        .wait_with_timeout(Duration::from_secs(3))
        .expect("bucketfs did not exit within 3s of SIGINT");
    assert!(status.success(), "expected exit 0, got {:?}", status);
    assert!(
        mount.stderr_contains("unmounting (received signal)"),
        "missing 'unmounting' message in stderr:\n{}",
        mount.stderr_snapshot().join("\n"),
    );
    assert!(
        mount.stderr_contains("bucketfs: unmounted"),
        "missing 'unmounted' message in stderr:\n{}",
        mount.stderr_snapshot().join("\n"),
    );
    wait_until_unmounted(mount.mountpoint(), Duration::from_secs(2));
}

/// Scenario 2: ordinary file work through the kernel.
///
/// Expected: files written through the mount read back intact once closed, directories
/// can be created and listed, renames and deletes are visible immediately.
#[test]
#[ignore]
fn scenario_02_file_round_trip() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));
    let root = mount.mountpoint().to_path_buf();

    std::fs::create_dir(root.join("reports")).expect("mkdir");
    std::fs::write(root.join("reports/q1.txt"), b"revenue up").expect("write");
    wait_for_contents(&root.join("reports/q1.txt"), b"revenue up", Duration::from_secs(5));

    let mut names: Vec<_> = std::fs::read_dir(&root)
        .expect("readdir")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["reports"]);

    std::fs::rename(root.join("reports/q1.txt"), root.join("q1.txt")).expect("rename");
    assert!(root.join("q1.txt").exists());
    assert!(!root.join("reports/q1.txt").exists());

    std::fs::remove_file(root.join("q1.txt")).expect("unlink");
    std::fs::remove_dir(root.join("reports")).expect("rmdir");
    assert_eq!(std::fs::read_dir(&root).expect("readdir").count(), 0);

    mount.send_signal(libc::SIGINT);
    mount.wait_with_timeout(Duration::from_secs(3));
}

/// Scenario 3: rmdir of a directory that still has files.
///
/// Expected: the call fails with ENOTEMPTY and the contents survive.
#[test]
#[ignore]
fn scenario_03_rmdir_non_empty() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));
    let root = mount.mountpoint().to_path_buf();

    std::fs::create_dir(root.join("src")).expect("mkdir");
    std::fs::write(root.join("src/lib.rs"), b"fn main() {}").expect("write");
    wait_for_contents(&root.join("src/lib.rs"), b"fn main() {}", Duration::from_secs(5));

    let err = std::fs::remove_dir(root.join("src")).expect_err("rmdir should fail");
    assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
    assert!(root.join("src/lib.rs").exists());

    mount.send_signal(libc::SIGINT);
    mount.wait_with_timeout(Duration::from_secs(3));
}

/// Scenario 4: external unmount via `bucketfs unmount`, mount not busy.
///
/// Expected: unmount command succeeds, the mount process notices its only
/// mount is gone and exits 0.
#[test]
#[ignore]
fn scenario_04_external_unmount_not_busy() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));

    let output = bucketfs(&["unmount", mount.mountpoint().to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "bucketfs unmount failed: {}", stderr);
    assert!(
        stderr.contains("Successfully unmounted"),
        "unexpected unmount stderr: {}",
        stderr,
    );

    let status = mount
        .wait_with_timeout(Duration::from_secs(3))
        .expect("bucketfs mount process did not exit after external unmount");
    assert!(status.success(), "expected exit 0, got {:?}", status);
    assert!(
        mount.wait_for_stderr("no mounts left", Duration::from_secs(2)),
        "bucketfs never reported the lost mount:\n{}",
        mount.stderr_snapshot().join("\n"),
    );
}

/// Scenario 5: external unmount via `bucketfs unmount`, mount is busy.
///
/// Expected: unmount command fails with a "busy" message. bucketfs keeps
/// running and the mount is unaffected.
#[test]
#[ignore]
fn scenario_05_external_unmount_busy() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));

    let mut busy = hold_busy(mount.mountpoint());

    let output = bucketfs(&["unmount", mount.mountpoint().to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "unmount should have failed when busy, but succeeded",
    );
    assert!(stderr.contains("busy"), "expected 'busy' in stderr, got: {}", stderr);

    assert!(mount.is_running(), "bucketfs should still be running");
    assert!(is_mounted(mount.mountpoint()), "mount should still be present");

    kill_child(&mut busy);
    mount.send_signal(libc::SIGINT);
    mount.wait_with_timeout(Duration::from_secs(3));
}

/// Scenario 6: SIGTERM behaves like ctrl-C.
#[test]
#[ignore]
fn scenario_06_sigterm() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));

    mount.send_signal(libc::SIGTERM);

    let status = mount
        .wait_with_timeout(Duration::from_secs(3))
        .expect("bucketfs did not exit within 3s of SIGTERM");
    assert!(status.success(), "expected exit 0, got {:?}", status);
    wait_until_unmounted(mount.mountpoint(), Duration::from_secs(2));
}

/// Scenario 7: a descriptor closed while a duplicate keeps writing.
///
/// Expected: closing the duplicate does not cut the file short; everything
/// written through the surviving descriptor lands in one object.
#[test]
#[ignore]
fn scenario_07_write_after_closing_a_duplicate() {
    let mut mount = BucketMount::start();
    mount.wait_for_mount(Duration::from_secs(5));
    let path = mount.mountpoint().join("app.log");

    let mut file = std::fs::File::create(&path).expect("create");
    file.write_all(b"part1 ").expect("write");
    drop(file.try_clone().expect("dup"));
    file.write_all(b"part2").expect("write after dup closed");
    drop(file);

    wait_for_contents(&path, b"part1 part2", Duration::from_secs(5));

    mount.send_signal(libc::SIGINT);
    mount.wait_with_timeout(Duration::from_secs(3));
}
