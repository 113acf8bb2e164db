//! Relay daemon binary.
//!
//! # Usage
//!
//! ```bash
//! # Start in the foreground (standalone)
//! relayd start
//!
//! # Start in production mode (primary + worker pool)
//! RELAY_ENV=production relayd start
//!
//! # Stop a running daemon
//! relayd stop
//!
//! # Check daemon status
//! relayd status
//!
//! # Enable debug logging
//! RUST_LOG=relayd=debug relayd start
//! ```
//!
//! # Signal Handling
//!
//! SIGTERM/SIGINT/SIGQUIT start a graceful shutdown; after the grace
//! window (SHUTDOWN_TIMEOUT, default 30 s) the process exits forcibly.

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relayd::config::Config;
use relayd::daemon::{
    is_process_running, is_worker_role, primary_pid_path, read_pid, remove_pid_file,
    worker_pid_path, write_pid_file, Daemon,
};

/// Relay daemon - messaging gateway supervision core
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start,
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env();

    let command = args.command.unwrap_or(Command::Start);

    match command {
        Command::Start => {
            let pid_path = if is_worker_role() {
                worker_pid_path(&config.log_directory, process::id())
            } else {
                let path = primary_pid_path(&config.log_directory);
                if let Some(pid) = running_daemon(&path) {
                    eprintln!("Daemon is already running (PID {pid})");
                    eprintln!("Use 'relayd stop' to stop it first.");
                    process::exit(1);
                }
                path
            };

            write_pid_file(&pid_path)?;
            let result = run_daemon(config);
            remove_pid_file(&pid_path);
            result
        }
        Command::Stop => {
            let pid_path = primary_pid_path(&config.log_directory);
            if let Some(pid) = running_daemon(&pid_path) {
                println!("Stopping daemon (PID {pid})...");
                send_sigterm(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            let pid_path = primary_pid_path(&config.log_directory);
            if let Some(pid) = running_daemon(&pid_path) {
                println!("Daemon is running (PID {pid})");
                println!("Log directory: {}", config.log_directory.display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Returns the PID from the PID file if that process is alive; removes a
/// stale file otherwise.
fn running_daemon(pid_path: &PathBuf) -> Option<u32> {
    if let Some(pid) = read_pid(pid_path) {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file(pid_path);
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn send_sigterm(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        production = config.production,
        worker = is_worker_role(),
        "Relay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    let grace = config.shutdown_grace;
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!(grace_secs = grace.as_secs(), "Shutdown signal received");
        shutdown_token.cancel();

        // Forced exit if graceful shutdown overruns the grace window
        tokio::time::sleep(grace).await;
        warn!("Shutdown grace window elapsed, exiting forcibly");
        process::exit(1);
    });

    let daemon = Daemon::new(config);
    daemon.run(cancel_token).await?;

    info!("Relay daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM, SIGINT or SIGQUIT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
