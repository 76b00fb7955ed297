//! Mount scenarios for rowfs.
//!
//! These tests require a working FUSE installation (libfuse or macFUSE).
//! They are ignored by default. Run with:
//!
//!     cargo test --test scenarios -- --ignored --test-threads=1

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A running `rowfs mount` process with helpers for inspecting and controlling it.
struct RowfsMount {
    child: Child,
    mountpoint: TempDir,
    stderr_lines: Arc<Mutex<Vec<String>>>,
    _stderr_thread: Option<std::thread::JoinHandle<()>>,
}

impl RowfsMount {
    /// Spawn `rowfs mount` over `database` at a fresh temp mountpoint.
    fn start(database: &Path, session_id: &str) -> Self {
        let mountpoint = tempfile::tempdir().expect("create mountpoint tmpdir");
        let log_file = database.with_extension(format!("{}.log", session_id));

        let mut child = Command::new(env!("CARGO_BIN_EXE_rowfs"))
            .args([
                "mount",
                mountpoint.path().to_str().unwrap(),
                "--database",
                database.to_str().unwrap(),
                "--session-id",
                session_id,
                "--log-file",
                log_file.to_str().unwrap(),
            ])
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn rowfs mount");

        let stderr = child.stderr.take().unwrap();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();

        let thread = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().flatten() {
                lines_clone.lock().unwrap().push(line);
            }
        });

        Self {
            child,
            mountpoint,
            stderr_lines: lines,
            _stderr_thread: Some(thread),
        }
    }

    fn mountpoint(&self) -> &Path {
        self.mountpoint.path()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.mountpoint().join(rel)
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
            "rowfs mount did not appear at {:?} within {:?}\nstderr so far:\n{}",
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

impl Drop for RowfsMount {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            unsafe {
                libc::kill(self.pid(), libc::SIGKILL);
            }
            let _ = self.child.wait();
        }
        // Force-unmount if still mounted so the temp dir can be cleaned up.
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

fn rowfs_unmount(mountpoint: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_rowfs"))
        .args(["unmount", mountpoint.to_str().unwrap()])
        .output()
        .expect("failed to run rowfs unmount")
}

fn fresh_database() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create db tmpdir");
    let db = dir.path().join("rowfs.db");
    (dir, db)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// ctrl-C on an idle mount unmounts promptly and exits 0.
#[test]
#[ignore]
fn scenario_01_ctrl_c_not_busy() {
    let (_dir, db) = fresh_database();
    let mut rowfs = RowfsMount::start(&db, "s1");
    rowfs.wait_for_mount(Duration::from_secs(5));

    rowfs.send_signal(libc::SIGINT);

    let status = rowfs
        .wait_with_timeout(Duration::from_secs(3))
        .expect("rowfs did not exit within 3s of SIGINT");
    assert!(status.success(), "expected exit 0, got {:?}", status);
    assert!(
        rowfs.stderr_contains("unmounted"),
        "missing 'unmounted' message in stderr:\n{}",
        rowfs.stderr_snapshot().join("\n"),
    );
    wait_until_unmounted(rowfs.mountpoint(), Duration::from_secs(2));
}

/// Ordinary file operations through the kernel land in the database.
#[test]
#[ignore]
fn scenario_02_file_operations() {
    let (_dir, db) = fresh_database();
    let mut rowfs = RowfsMount::start(&db, "s2");
    rowfs.wait_for_mount(Duration::from_secs(5));

    std::fs::create_dir(rowfs.path("docs")).expect("mkdir through mount");
    std::fs::write(rowfs.path("docs/a.txt"), b"hello rowfs\n").expect("write through mount");

    let mut contents = String::new();
    File::open(rowfs.path("docs/a.txt"))
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "hello rowfs\n");

    let mut names: Vec<String> = std::fs::read_dir(rowfs.path("docs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt"]);

    let err = std::fs::remove_dir(rowfs.path("docs")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));

    std::fs::remove_file(rowfs.path("docs/a.txt")).unwrap();
    std::fs::remove_dir(rowfs.path("docs")).unwrap();
    assert!(!rowfs.path("docs").exists());

    rowfs.send_signal(libc::SIGINT);
    rowfs.wait_with_timeout(Duration::from_secs(3));
}

/// Two mounts over one database: data is shared and write opens exclude
/// each other.
#[test]
#[ignore]
fn scenario_03_two_mounts_share_locks() {
    let (_dir, db) = fresh_database();
    let mut a = RowfsMount::start(&db, "host-a");
    a.wait_for_mount(Duration::from_secs(5));
    let mut b = RowfsMount::start(&db, "host-b");
    b.wait_for_mount(Duration::from_secs(5));

    let mut writer = OpenOptions::new()
        .create(true)
        .write(true)
        .open(a.path("shared.txt"))
        .expect("create through mount a");
    writer.write_all(b"from a").unwrap();
    writer.flush().unwrap();

    // Attribute caching is short, so give the second kernel a moment.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(std::fs::read(b.path("shared.txt")).unwrap(), b"from a");

    let err = OpenOptions::new()
        .write(true)
        .open(b.path("shared.txt"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    drop(writer);
    std::thread::sleep(Duration::from_millis(200));
    OpenOptions::new()
        .write(true)
        .open(b.path("shared.txt"))
        .expect("write open after release");

    a.send_signal(libc::SIGINT);
    b.send_signal(libc::SIGINT);
    a.wait_with_timeout(Duration::from_secs(3));
    b.wait_with_timeout(Duration::from_secs(3));
}

/// External unmount via `rowfs unmount` ends the mount process cleanly.
#[test]
#[ignore]
fn scenario_04_external_unmount() {
    let (_dir, db) = fresh_database();
    let mut rowfs = RowfsMount::start(&db, "s4");
    rowfs.wait_for_mount(Duration::from_secs(5));

    let output = rowfs_unmount(rowfs.mountpoint());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "rowfs unmount failed: {}", stderr);
    assert!(
        stderr.contains("Successfully unmounted"),
        "unexpected unmount stderr: {}",
        stderr,
    );

    let status = rowfs
        .wait_with_timeout(Duration::from_secs(3))
        .expect("rowfs mount process did not exit after external unmount");
    assert!(status.success(), "expected exit 0, got {:?}", status);
    assert!(
        rowfs.wait_for_stderr("unmounted", Duration::from_secs(2)),
        "rowfs never printed 'unmounted':\n{}",
        rowfs.stderr_snapshot().join("\n"),
    );
}

/// ctrl-C with a write handle open warns and lists the locked file; a second
/// ctrl-C forces the unmount and the lock is gone afterwards.
#[test]
#[ignore]
fn scenario_05_ctrl_c_open_handles() {
    let (_dir, db) = fresh_database();
    let mut rowfs = RowfsMount::start(&db, "s5");
    rowfs.wait_for_mount(Duration::from_secs(5));

    let _file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(rowfs.path("held.txt"))
        .expect("create through mount");

    rowfs.send_signal(libc::SIGINT);
    assert!(
        rowfs.wait_for_stderr("mount is busy", Duration::from_secs(3)),
        "missing 'mount is busy' warning:\n{}",
        rowfs.stderr_snapshot().join("\n"),
    );
    assert!(rowfs.stderr_contains("/held.txt"));
    assert!(rowfs.is_running(), "rowfs should still be running after first ctrl-C");

    rowfs.send_signal(libc::SIGINT);
    let status = rowfs
        .wait_with_timeout(Duration::from_secs(3))
        .expect("rowfs did not exit after second SIGINT");
    assert!(status.success(), "expected exit 0, got {:?}", status);

    let output = Command::new(env!("CARGO_BIN_EXE_rowfs"))
        .args(["locks", "--database", db.to_str().unwrap()])
        .output()
        .expect("failed to run rowfs locks");
    let locks: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(locks, serde_json::json!([]));
}
