// SPDX-License-Identifier: MIT

//! Dockhand Daemon (dhd)
//!
//! Background process that orchestrates developer-sandbox containers:
//! per-container instruction queues and workers, assistant sessions,
//! health monitoring, and log collection.
//!
//! Architecture: the engine's Orchestrator owns every component; this
//! binary wires the Docker runtime, the file-backed container directory,
//! and the state directory together, then supervises shutdown.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod directory;

use std::fs::File;
use std::io::Write as _;
use std::sync::Arc;

use dh_adapters::{ContainerRuntime, DesktopNotifyAdapter, DockerRuntime};
use dh_core::SystemClock;
use dh_engine::{EngineConfig, Orchestrator, SharedConfig};
use fs2::FileExt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::directory::FileDirectory;

/// Rotate the daemon log when it exceeds this size (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

type DaemonOrchestrator = Orchestrator<DockerRuntime, SystemClock, DesktopNotifyAdapter>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("dhd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("dhd {}", env!("CARGO_PKG_VERSION"));
                println!("Dockhand Daemon - orchestrates developer-sandbox containers");
                println!();
                println!("USAGE:");
                println!("    dhd");
                println!();
                println!("The daemon reads container records from containers.json under");
                println!("its state directory and serves instruction queues for them.");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                println!();
                println!("ENVIRONMENT:");
                println!("    DH_STATE_DIR     State directory override");
                println!("    DH_DOCKER_SOCK   Container runtime socket");
                println!("    DH_LOG           Log filter (tracing EnvFilter syntax)");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: dhd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load()?;
    rotate_log_if_needed(&config);
    let _log_guard = setup_logging(&config)?;

    // Single-instance lock: a second daemon exits with a readable message.
    let lock_file = match acquire_lock(&config) {
        Ok(file) => file,
        Err(pid) => {
            eprintln!("dhd is already running");
            if !pid.is_empty() {
                eprintln!("  pid: {pid}");
            }
            std::process::exit(1);
        }
    };

    info!(state_dir = %config.state_dir.display(), "starting dockhand daemon");

    let engine_config: SharedConfig =
        EngineConfig::load(&config.engine_config_path)?.into_shared();
    let runtime = Arc::new(DockerRuntime::from_env());
    if !runtime.ping().await {
        warn!("container runtime is not responding; continuing, operations will retry");
    }
    let directory = Arc::new(FileDirectory::new(&config.containers_path));
    let notify = DesktopNotifyAdapter::new();

    let orchestrator: DaemonOrchestrator = Orchestrator::new(
        runtime,
        directory,
        notify,
        &config.state_dir,
        Arc::clone(&engine_config),
        SystemClock,
    )?;
    orchestrator.start().await;
    info!("daemon ready");

    run_until_shutdown(&orchestrator, &config, &engine_config).await;

    orchestrator.shutdown().await;
    drop(lock_file);
    let _ = std::fs::remove_file(&config.lock_path);
    info!("daemon stopped");
    Ok(())
}

/// Wait for SIGTERM/SIGINT, reloading engine config on SIGHUP.
async fn run_until_shutdown(
    _orchestrator: &DaemonOrchestrator,
    config: &Config,
    engine_config: &SharedConfig,
) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                return;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                return;
            }
            _ = sighup.recv() => {
                match EngineConfig::load(&config.engine_config_path) {
                    Ok(fresh) => {
                        *engine_config.write() = fresh;
                        info!("engine configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "config reload failed, keeping current"),
                }
            }
        }
    }
}

/// Take the exclusive PID-file lock. On failure returns the incumbent's
/// pid for the error message.
fn acquire_lock(config: &Config) -> Result<File, String> {
    let file = match File::options().create(true).truncate(false).write(true).open(&config.lock_path) {
        Ok(file) => file,
        Err(_) => return Err(String::new()),
    };
    if file.try_lock_exclusive().is_err() {
        let pid = std::fs::read_to_string(&config.lock_path).unwrap_or_default();
        return Err(pid.trim().to_string());
    }
    let mut file = file;
    let _ = file.set_len(0);
    let _ = writeln!(file, "{}", std::process::id());
    let _ = file.sync_all();
    Ok(file)
}

/// Rotate the log file once it has grown too large. Keeps one previous
/// generation as `daemon.log.1`.
fn rotate_log_if_needed(config: &Config) {
    let Ok(metadata) = std::fs::metadata(&config.log_path) else { return };
    if metadata.len() < MAX_LOG_SIZE {
        return;
    }
    let rotated = config.log_path.with_extension("log.1");
    let _ = std::fs::rename(&config.log_path, rotated);
}

/// Non-blocking file logging with `DH_LOG` filtering.
fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;

    let file = File::options().create(true).append(true).open(&config.log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_env("DH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .init();
    Ok(guard)
}
