use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use bucketfs::config::{Cli, Command, Credentials, FsSettings, MountConfig, MountDescriptor};
use bucketfs::fs::FILE_SYSTEM_NAME;
use bucketfs::fuse::FuseDriver;
use bucketfs::mount::{MountEvent, MountManager};
use bucketfs::store::DefaultConnector;

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

enum ShutdownReason {
    Signal,
    /// Every mount failed or was unmounted from outside.
    NothingMounted,
}

fn init_logging(log_file: &Path) -> WorkerGuard {
    let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_name = log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("bucketfs.log"));
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
        .expect("Failed to set tracing subscriber");
    guard
}

/// Log a mount event. Returns true for failures.
fn report(event: MountEvent) -> bool {
    match event {
        MountEvent::Mounting { drive, bucket } => info!("mounting {} on {}", bucket, drive),
        MountEvent::Unmounted { drive } => info!("{} unmounted", drive),
        MountEvent::Failed { drive, error } => {
            error!("{} failed: {}", drive, error);
            eprintln!("bucketfs: mount of {} failed: {}", drive, error);
            return true;
        }
    }
    false
}

/// Block until SIGINT/SIGTERM or until no mount is left, reporting mount
/// events as they arrive.
fn wait_for_shutdown(
    manager: &MountManager,
    events: &flume::Receiver<MountEvent>,
    failures: &mut usize,
) -> std::io::Result<ShutdownReason> {
    let mut pipe_fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    SIGNAL_PIPE.store(pipe_fds[1], Ordering::Relaxed);

    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
    }

    let reason = loop {
        let mut pfd = libc::pollfd {
            fd: pipe_fds[0],
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 200) }; // 200 ms timeout

        *failures += events.try_iter().map(report).filter(|failed| *failed).count();

        if ret > 0 {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
            }
            eprintln!("bucketfs: unmounting (received signal)...");
            break ShutdownReason::Signal;
        }

        if !manager.is_any_mounted() {
            break ShutdownReason::NothingMounted;
        }
    };

    SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    unsafe {
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }

    Ok(reason)
}

fn config_at(path: Option<PathBuf>) -> MountConfig {
    MountConfig::new(path.unwrap_or_else(MountConfig::default_path))
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            config,
            log_file,
            listing_ttl_secs,
        } => {
            let _guard = init_logging(&log_file);
            let config = config_at(config);

            let descriptors: Vec<MountDescriptor> = config
                .load()
                .into_iter()
                .filter(|d| {
                    // macFUSE does not clean these up after a crash.
                    if is_stale_mount(&d.mountpoint) {
                        eprintln!(
                            "Error: {} is a stale bucketfs mount. Fix with:  bucketfs unmount {}",
                            d.drive(),
                            d.drive(),
                        );
                        return false;
                    }
                    true
                })
                .collect();
            if descriptors.is_empty() {
                eprintln!(
                    "No mounts configured in {}. Add one with `bucketfs add`.",
                    config.path().display()
                );
                std::process::exit(1);
            }

            let connector = match DefaultConnector::new() {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to start store client: {}", e);
                    std::process::exit(1);
                }
            };
            let settings = FsSettings {
                listing_ttl: Duration::from_secs(listing_ttl_secs),
                ..FsSettings::default()
            };

            let manager = MountManager::new(Arc::new(connector), Arc::new(FuseDriver), settings);
            let events = manager.events();

            info!("bucketfs starting: {} mount(s) from {}", descriptors.len(), config.path().display());
            manager.mount_all(&descriptors);

            let mut failures = 0;
            let reason = match wait_for_shutdown(&manager, &events, &mut failures) {
                Ok(reason) => reason,
                Err(e) => {
                    error!("Failed to wait for signals: {}", e);
                    ShutdownReason::Signal
                }
            };

            manager.unmount_all();
            manager.join_detached();
            failures += events.try_iter().map(report).filter(|failed| *failed).count();

            if let ShutdownReason::NothingMounted = reason {
                eprintln!("bucketfs: no mounts left");
            }
            eprintln!("bucketfs: unmounted");
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Command::Add {
            mountpoint,
            bucket,
            access,
            config,
        } => {
            let credentials = access.into_credentials().unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            });
            let mountpoint = std::path::absolute(&mountpoint).unwrap_or_else(|e| {
                eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
                std::process::exit(1);
            });
            let descriptor = MountDescriptor {
                mountpoint,
                bucket,
                credentials,
            };
            let config = config_at(config);
            if let Err(e) = config.add(descriptor.clone()) {
                eprintln!("Error saving {}: {}", config.path().display(), e);
                std::process::exit(1);
            }
            eprintln!("Saved {} -> {}", descriptor.bucket, descriptor.drive());
        }
        Command::List { config } => {
            let config = config_at(config);
            let mounts = config.try_load().unwrap_or_else(|e| {
                eprintln!("Error reading {}: {}", config.path().display(), e);
                std::process::exit(1);
            });
            for mount in mounts {
                let access = match &mount.credentials {
                    Credentials::Satellite { address, .. } => address.as_str(),
                    Credentials::AccessGrant { .. } => "access grant",
                };
                println!("{}\t{}\t{}", mount.drive(), mount.bucket, access);
            }
        }
        Command::Remove { mountpoint, config } => {
            let config = config_at(config);
            let mountpoint = std::path::absolute(&mountpoint).unwrap_or(mountpoint);
            match config.remove(&mountpoint) {
                Ok(true) => eprintln!("Removed {}", mountpoint.display()),
                Ok(false) => {
                    eprintln!("No saved mount at {}", mountpoint.display());
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Error saving {}: {}", config.path().display(), e);
                    std::process::exit(1);
                }
            }
        }
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

/// Whether `mount` output lists a bucketfs volume at `path`. The driver
/// mounts with `fsname=bucketfs`, so its lines read `bucketfs on <path> ...`
/// on both Linux and macOS.
fn lists_mount(mount_output: &str, path: &Path) -> bool {
    let prefix = format!("{} on {} ", FILE_SYSTEM_NAME, path.display());
    mount_output.lines().any(|line| line.starts_with(&prefix))
}

/// A bucketfs volume left behind by a crashed process: still listed, but
/// readdir fails.
fn is_stale_mount(path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    lists_mount(&String::from_utf8_lossy(&output.stdout), path) && std::fs::read_dir(path).is_err()
}

fn is_busy(output: &std::process::Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("busy")
        || String::from_utf8_lossy(&output.stdout).contains("busy")
}

fn unmount(mountpoint: &Path) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|_| mountpoint.to_path_buf());
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    // umount first, then diskutil on macOS, then force.
    let attempts: [(&str, Vec<&str>); 2] = [("umount", vec![&*mp]), ("diskutil", vec!["unmount", &*mp])];
    for (program, args) in attempts {
        let output = std::process::Command::new(program).args(&args).output();
        match output {
            Ok(o) if o.status.success() => {
                eprintln!("Successfully unmounted {}", mp);
                return;
            }
            Ok(o) if is_busy(&o) => {
                eprintln!(
                    "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                    mp
                );
                std::process::exit(1);
            }
            Ok(_) => {}
            Err(e) => warn!("{} unavailable: {}", program, e),
        }
    }

    let status = std::process::Command::new("umount")
        .args(["-f", &*mp])
        .status();

    if matches!(status, Ok(s) if s.success()) {
        eprintln!("Successfully unmounted {} (forced)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -f {}", mp, mp);
    std::process::exit(1);
}
