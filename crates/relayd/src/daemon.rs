//! Daemon lifecycle: role selection, PID files, startup order, shutdown.
//!
//! In production mode the first process takes the primary role: it only
//! runs the worker pool and the health monitor. Spawned workers (marked
//! by the worker-role environment variable) and every non-production run
//! take the worker role: registry, fault dispatcher, monitor, heartbeat,
//! session bring-up, outbound processing.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::faults::fault_channel;
use crate::heartbeat::spawn_heartbeat_task;
use crate::monitor::{spawn_monitor_task, SysinfoProbe};
use crate::outbound::{spawn_outbound_processor, SpoolQueue};
use crate::pool::{desired_pool_size, ProcessSpawner, WorkerPool, WORKER_ROLE_ENV};
use crate::recorder::CrashRecorder;
use crate::recovery::{ProcessExit, RecoveryController, SystemProcessManager};
use crate::registry::spawn_registry;
use crate::starter::SessionStarter;
use crate::tenants::{StaticDirectory, TenantDirectory};

/// PID file of the primary (or the sole standalone process).
pub fn primary_pid_path(log_dir: &Path) -> PathBuf {
    log_dir.join("server-primary.pid")
}

/// PID file of one worker process.
pub fn worker_pid_path(log_dir: &Path, pid: u32) -> PathBuf {
    log_dir.join(format!("server-{pid}.pid"))
}

/// Writes the current PID to the given file, creating the directory.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }
    let mut file = File::create(path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

/// Reads a PID from a PID file, if present and well-formed.
pub fn read_pid(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Checks if a process with the given PID is running.
pub fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// True when this process was spawned as a pool worker.
pub fn is_worker_role() -> bool {
    std::env::var(WORKER_ROLE_ENV).is_ok()
}

/// The relay daemon, parameterized only by its resolved configuration.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs until the token is cancelled.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<()> {
        if self.config.production && !is_worker_role() {
            self.run_primary(cancel_token).await
        } else {
            self.run_worker(cancel_token).await
        }
    }

    /// Primary role: worker pool plus health monitor, nothing else.
    async fn run_primary(self, cancel_token: CancellationToken) -> Result<()> {
        info!(pid = process::id(), "Primary starting");

        let (fault_sender, fault_receiver) = fault_channel();
        let recorder = CrashRecorder::new(&self.config.log_directory);

        // The primary still needs the fatal-fault path: a threshold
        // breach in the primary escalates like any other fatal fault.
        let registry = spawn_registry();
        let directory: Arc<StaticDirectory> = Arc::new(StaticDirectory::default());
        let starter = SessionStarter::new(
            registry,
            directory.clone(),
            Arc::new(crate::connector::TcpConnector),
            fault_sender.clone(),
            self.config.session_settings(),
        );
        let controller = RecoveryController::new(
            Arc::new(SystemProcessManager::new(&self.config.restart_command)),
            Arc::new(ProcessExit),
            starter,
            directory,
            recorder,
            self.config.recovery_settings(),
        );
        controller.spawn_dispatcher(fault_receiver, cancel_token.clone());

        spawn_monitor_task(
            SysinfoProbe::new(),
            self.config.monitor_settings(),
            fault_sender,
            cancel_token.clone(),
        );

        let size = desired_pool_size(self.config.max_workers);
        let pool = WorkerPool::new(Arc::new(ProcessSpawner), size);
        pool.run(cancel_token).await;

        info!("Primary stopped");
        Ok(())
    }

    /// Worker role: the full supervision stack.
    ///
    /// Startup order matters: the fault dispatcher must be running before
    /// the monitor or any session can report, and sessions must be up
    /// before outbound jobs are drained.
    async fn run_worker(self, cancel_token: CancellationToken) -> Result<()> {
        info!(pid = process::id(), "Worker starting");

        let registry = spawn_registry();
        let (fault_sender, fault_receiver) = fault_channel();
        let recorder = CrashRecorder::new(&self.config.log_directory);

        let directory = self.load_directory();
        let starter = SessionStarter::new(
            registry.clone(),
            directory.clone(),
            Arc::new(crate::connector::TcpConnector),
            fault_sender.clone(),
            self.config.session_settings(),
        );

        let controller = RecoveryController::new(
            Arc::new(SystemProcessManager::new(&self.config.restart_command)),
            Arc::new(ProcessExit),
            starter.clone(),
            directory,
            recorder,
            self.config.recovery_settings(),
        );
        controller.spawn_dispatcher(fault_receiver, cancel_token.clone());

        spawn_monitor_task(
            SysinfoProbe::new(),
            self.config.monitor_settings(),
            fault_sender,
            cancel_token.clone(),
        );

        if self.config.production {
            spawn_heartbeat_task(self.config.log_directory.clone(), cancel_token.clone());
        }

        let reports = starter.start_all_active_tenants().await;
        info!(tenants = reports.len(), "Session bring-up done");

        // Outbound processing is optional and strictly best-effort: a
        // spool that cannot be opened must not abort the worker.
        if let Some(spool_dir) = &self.config.spool_directory {
            match SpoolQueue::open(spool_dir).await {
                Ok(queue) => {
                    spawn_outbound_processor(queue, registry.clone(), cancel_token.clone());
                }
                Err(e) => {
                    error!(dir = %spool_dir.display(), error = %e, "Could not open outbound spool");
                }
            }
        }

        cancel_token.cancelled().await;
        info!("Worker shutting down");

        for snapshot in registry.list_active().await {
            registry.stop(snapshot.key).await;
        }

        info!("Worker stopped");
        Ok(())
    }

    fn load_directory(&self) -> Arc<dyn TenantDirectory> {
        match &self.config.tenants_file {
            Some(path) => match StaticDirectory::load(path) {
                Ok(directory) => {
                    info!(
                        path = %path.display(),
                        tenants = directory.tenant_count(),
                        "Tenant directory loaded"
                    );
                    Arc::new(directory)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not load tenant directory, starting empty");
                    Arc::new(StaticDirectory::default())
                }
            },
            None => {
                warn!("No tenant directory configured, starting empty");
                Arc::new(StaticDirectory::default())
            }
        }
    }
}
