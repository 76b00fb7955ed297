use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use rowfs::config::{lock_age, Cli, Command, RowfsConfig, StoreArgs};
use rowfs::error::{FsError, Result};
use rowfs::fs::handles::HandleTable;
use rowfs::fs::ops::Dispatcher;
use rowfs::fs::RowFs;
use rowfs::store::LockInfo;

/// Write-end of the self-pipe used for signal notification.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(_sig: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum ShutdownAction {
    /// Second signal while the mount was busy.
    ForceUnmount,
    /// The session already ended, or the mount came off cleanly.
    Unmounted,
}

/// Self-pipe the signal handler writes to. Dropping it detaches the handler.
struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    fn install() -> Result<Self> {
        let (read, write) = nix::unistd::pipe()
            .map_err(|e| FsError::Mount(format!("failed to create signal pipe: {}", e)))?;
        SIGNAL_PIPE.store(write.as_raw_fd(), Ordering::Relaxed);
        unsafe {
            use nix::sys::signal::{signal, SigHandler, Signal};
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                signal(sig, SigHandler::Handler(signal_handler)).ok();
            }
        }
        Ok(Self {
            read,
            _write: write,
        })
    }

    /// Wait up to `timeout_ms` for a signal. Returns true if one arrived.
    fn wait(&self, timeout_ms: libc::c_int) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, timeout_ms) } <= 0 {
            return false;
        }
        let mut buf = [0u8; 1];
        unsafe {
            libc::read(pfd.fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
        }
        true
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    }
}

/// Tell the user what keeps the mount busy, write locks first.
fn report_busy(file_handles: &HandleTable) {
    const SHOWN: usize = 10;
    let mut open = file_handles.list_open();
    if open.is_empty() {
        eprintln!("rowfs: mount is busy, processes are using the mountpoint");
    } else {
        open.sort_by_key(|h| !h.file.intent.writes());
        eprintln!("rowfs: mount is busy, {} open file(s):", open.len());
        for h in open.iter().take(SHOWN) {
            if h.file.intent.writes() {
                eprintln!("  {}  (write lock held by {})", h.file.path, h.file.holder);
            } else {
                eprintln!("  {}", h.file.path);
            }
        }
        if open.len() > SHOWN {
            eprintln!("  and {} more...", open.len() - SHOWN);
        }
    }
    eprintln!("Close open files to unmount cleanly, or press ctrl-C again to force unmount.");
}

/// Two-phase shutdown. A signal on an idle mount unmounts it. A signal on a
/// busy mount reports what is open and keeps serving, retrying the unmount
/// every second; a second signal forces it.
fn wait_for_shutdown(
    guard: &std::thread::JoinHandle<std::io::Result<()>>,
    file_handles: &HandleTable,
    mountpoint: &Path,
) -> Result<ShutdownAction> {
    let signals = SignalPipe::install()?;
    let mut draining = false;
    let mut last_try = Instant::now();

    loop {
        let signalled = signals.wait(200);
        if guard.is_finished() {
            return Ok(ShutdownAction::Unmounted);
        }
        if signalled {
            if draining {
                eprintln!("rowfs: force unmounting...");
                return Ok(ShutdownAction::ForceUnmount);
            }
            if matches!(detach(mountpoint), Detach::Done) {
                eprintln!("rowfs: unmounting (received signal)...");
                return Ok(ShutdownAction::Unmounted);
            }
            draining = true;
            last_try = Instant::now();
            report_busy(file_handles);
        } else if draining && last_try.elapsed() >= Duration::from_secs(1) {
            last_try = Instant::now();
            if matches!(detach(mountpoint), Detach::Done) {
                eprintln!("rowfs: all clear, unmounting...");
                return Ok(ShutdownAction::Unmounted);
            }
        }
    }
}

/// Log to both `log_file` and stderr. The returned guard flushes the file
/// writer when dropped.
fn init_logging(log_file: &Path) -> Result<WorkerGuard> {
    let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_name = log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("rowfs.log"));
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| FsError::Config(format!("failed to set tracing subscriber: {}", e)))?;
    Ok(guard)
}

/// Stderr-only logging for the one-shot administrative commands.
fn init_stderr_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("rowfs: {}", e);
        std::process::exit(2);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Mount {
            mountpoint,
            store,
            session_id,
            log_file,
            lock_max_age_minutes,
        } => mount(mountpoint, store, session_id, log_file, lock_max_age_minutes),
        Command::Unmount { mountpoint } => unmount(&mountpoint),
        Command::Init { store } => {
            init_stderr_logging();
            let store = store.open()?;
            eprintln!("rowfs: initialized {}", store.location());
            Ok(())
        }
        Command::Locks { store } => {
            init_stderr_logging();
            let dispatcher = Dispatcher::new(store.open()?);
            let locks: Vec<LockInfo> = dispatcher.locks()?.iter().map(|l| l.info()).collect();
            let json = serde_json::to_string_pretty(&locks)
                .map_err(|e| FsError::Config(format!("failed to encode locks: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
        Command::Unlock {
            path,
            store,
            holder,
        } => {
            init_stderr_logging();
            let dispatcher = Dispatcher::new(store.open()?);
            dispatcher.unlock(&path, holder.as_deref())?;
            eprintln!("rowfs: unlocked {}", path);
            Ok(())
        }
        Command::Sweep {
            store,
            max_age_minutes,
        } => {
            init_stderr_logging();
            let dispatcher = Dispatcher::new(store.open()?);
            let swept = dispatcher.sweep_stale_locks(lock_age(max_age_minutes)?)?;
            for lock in &swept {
                println!("{}\t{}", lock.path, lock.holder);
            }
            eprintln!("rowfs: swept {} stale lock(s)", swept.len());
            Ok(())
        }
    }
}

fn mount(
    mountpoint: PathBuf,
    store_args: StoreArgs,
    session_id: Option<String>,
    log_file: PathBuf,
    lock_max_age_minutes: u64,
) -> Result<()> {
    // Create mountpoint if it doesn't exist
    if !mountpoint.exists() {
        std::fs::create_dir_all(&mountpoint).map_err(|e| {
            FsError::Mount(format!("creating mountpoint {:?}: {}", mountpoint, e))
        })?;
    }

    let mountpoint = std::fs::canonicalize(&mountpoint)
        .map_err(|e| FsError::Mount(format!("mountpoint {:?}: {}", mountpoint, e)))?;

    // A stale FUSE mount left behind by a previous crash or forced kill.
    if is_stale_mount(&mountpoint) {
        return Err(FsError::Mount(format!(
            "{} is still mounted by a rowfs session that exited. Run `rowfs unmount {}` first",
            mountpoint.display(),
            mountpoint.display(),
        )));
    }

    let sid = session_id.unwrap_or_else(|| format!("rowfs-{}", std::process::id()));

    let _log_guard = init_logging(&log_file)?;

    let config = RowfsConfig {
        database: store_args.database.clone(),
        mountpoint: mountpoint.clone(),
        session_id: sid.clone(),
        log_file,
        lock_max_age_minutes,
    };

    info!(
        "rowfs starting: session={}, database={}, mountpoint={}",
        sid,
        store_args.database.display(),
        mountpoint.display()
    );

    let store = store_args.open()?;
    let rowfs = RowFs::new(config.clone(), Arc::clone(&store));

    // Start the stale lock sweeper
    let shutdown = Arc::new(AtomicBool::new(false));
    let sweeper_handle = if lock_max_age_minutes > 0 {
        let handle = rowfs::state::sweeper::start_lock_sweeper(
            rowfs.dispatcher.clone(),
            lock_age(lock_max_age_minutes)?,
            shutdown.clone(),
        )
        .map_err(|e| FsError::Mount(format!("failed to start lock sweeper: {}", e)))?;
        Some(handle)
    } else {
        None
    };

    // Keep the handle table reachable from main after the filesystem moves
    // into the FUSE session.
    let mut file_handles_arc = Arc::clone(&rowfs.file_handles);

    let mut fuse_config = fuser::Config::default();
    fuse_config.mount_options = vec![
        fuser::MountOption::FSName("rowfs".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];
    fuse_config.acl = fuser::SessionACL::All;

    info!("Mounting rowfs filesystem...");

    let session = match fuser::spawn_mount2(rowfs, &mountpoint, &fuse_config) {
        Ok(session) => session,
        Err(e) if e.raw_os_error() == Some(libc::EPERM) || e.to_string().contains("allow_other") => {
            fuse_config.acl = fuser::SessionACL::Owner;
            info!("Retrying mount without allow_other...");
            let retry = RowFs::new(config, Arc::clone(&store));
            file_handles_arc = Arc::clone(&retry.file_handles);
            fuser::spawn_mount2(retry, &mountpoint, &fuse_config)
                .map_err(|e| FsError::Mount(format!("failed to mount: {}", e)))?
        }
        Err(e) => return Err(FsError::Mount(format!("failed to mount: {}", e))),
    };

    info!("rowfs mounted at {}", mountpoint.display());

    let action = wait_for_shutdown(&session.guard, &file_handles_arc, &mountpoint);

    // Stop the sweeper before joining the session for clean shutdown.
    shutdown.store(true, Ordering::Relaxed);
    if let Some(handle) = sweeper_handle {
        let _ = handle.join();
    }

    match action? {
        ShutdownAction::ForceUnmount => {
            if let Err(e) = session.umount_and_join() {
                error!("Error during unmount, detaching lazily: {}", e);
                let _ = std::process::Command::new("fusermount")
                    .arg("-uz")
                    .arg(&mountpoint)
                    .status();
            }
        }
        ShutdownAction::Unmounted => {
            if let Err(e) = session.join() {
                error!("Error joining FUSE session: {}", e);
            }
        }
    }

    eprintln!("rowfs: unmounted {}", mountpoint.display());
    Ok(())
}

/// A FUSE mount left by a process that died: still in the mount table but no
/// longer answering.
fn is_stale_mount(path: &Path) -> bool {
    let Ok(output) = std::process::Command::new("mount").output() else {
        return false;
    };
    let table = String::from_utf8_lossy(&output.stdout);
    let target = format!(" on {} ", path.display());
    table
        .lines()
        .any(|line| line.contains(&target) && line.contains("fuse"))
        && std::fs::read_dir(path).is_err()
}

/// Detach commands tried in order. fusermount covers unprivileged Linux
/// mounts; umount covers root and macOS.
const DETACHERS: &[(&str, &[&str])] = &[
    ("fusermount3", &["-u"]),
    ("fusermount", &["-u"]),
    ("umount", &[]),
];

enum Detach {
    Done,
    Busy,
    Failed(String),
}

fn detach(mountpoint: &Path) -> Detach {
    let mut reason = String::from("no unmount command found");
    for (program, args) in DETACHERS {
        // A missing program just moves on to the next one.
        let Ok(output) = std::process::Command::new(program)
            .args(*args)
            .arg(mountpoint)
            .output()
        else {
            continue;
        };
        if output.status.success() {
            return Detach::Done;
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("busy") {
            return Detach::Busy;
        }
        reason = format!("{}: {}", program, stderr);
    }
    Detach::Failed(reason)
}

fn unmount(mountpoint: &Path) -> Result<()> {
    let mountpoint = std::fs::canonicalize(mountpoint)
        .map_err(|e| FsError::Mount(format!("mountpoint {:?}: {}", mountpoint, e)))?;
    eprintln!("Unmounting {}...", mountpoint.display());
    match detach(&mountpoint) {
        Detach::Done => {
            eprintln!("Successfully unmounted {}", mountpoint.display());
            Ok(())
        }
        Detach::Busy => Err(FsError::Mount(format!(
            "{} is busy. Close shells and files using it, then try again",
            mountpoint.display()
        ))),
        Detach::Failed(reason) => Err(FsError::Mount(format!(
            "failed to unmount {}: {}",
            mountpoint.display(),
            reason
        ))),
    }
}
