//! Worker pool coordination for production mode.
//!
//! The primary process never serves traffic; it keeps a fixed-size pool
//! of worker processes alive, respawning any worker that exits for any
//! reason. Worker stdout/stderr lines are forwarded into the primary's
//! own log so operators get one stream. On shutdown the primary fans the
//! signal out by killing its children.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment marker that makes a spawned process take the worker role.
pub const WORKER_ROLE_ENV: &str = "RELAYD_WORKER";

/// Delay between attempts when the OS rejects a worker spawn.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pool size for a host: the configured maximum, capped by CPU count.
pub fn desired_pool_size(max_workers: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    max_workers.min(cpus).max(1)
}

/// Bookkeeping for one worker process; removed and replaced when the OS
/// reports the worker's exit.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub pid: u32,
    pub spawned_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// One spawned worker as seen by the pool.
#[async_trait]
pub trait WorkerChild: Send + 'static {
    fn pid(&self) -> u32;

    /// Waits for the worker to exit; `None` when no exit code is available
    /// (killed by signal).
    async fn wait(&mut self) -> Option<i32>;

    async fn kill(&mut self);
}

/// Spawns worker processes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    async fn spawn_worker(&self) -> io::Result<Box<dyn WorkerChild>>;
}

/// Re-executes the current binary with the worker-role marker set.
pub struct ProcessSpawner;

struct ProcessChild {
    child: tokio::process::Child,
    pid: u32,
}

#[async_trait]
impl WorkerChild for ProcessChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(pid = self.pid, error = %e, "Could not wait on worker");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "Could not kill worker");
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn_worker(&self) -> io::Result<Box<dyn WorkerChild>> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("start")
            .env(WORKER_ROLE_ENV, "1")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or(0);

        // One-way log forwarding: worker output lands in our log, tagged
        // with the worker pid.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid, "stderr"));
        }

        Ok(Box::new(ProcessChild { child, pid }))
    }
}

async fn forward_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    pid: u32,
    source: &'static str,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(worker = pid, source, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(worker = pid, source, error = %e, "Worker output stream ended");
                break;
            }
        }
    }
}

enum WorkerExit {
    /// Worker exited on its own and must be replaced.
    Crashed { pid: u32, exit_code: Option<i32> },

    /// Worker was killed as part of shutdown.
    Shutdown { pid: u32 },
}

/// Keeps the worker pool at its target size until shutdown.
pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    size: usize,
    descriptors: Arc<Mutex<HashMap<u32, WorkerDescriptor>>>,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, size: usize) -> Self {
        Self {
            spawner,
            size,
            descriptors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot of the pool's bookkeeping. Exited workers have already
    /// been retired, so every descriptor belongs to a live worker.
    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        match self.descriptors.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Number of workers currently alive.
    pub fn live_count(&self) -> usize {
        match self.descriptors.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn record_spawn(&self, pid: u32) {
        let descriptor = WorkerDescriptor {
            pid,
            spawned_at: Utc::now(),
            exit_code: None,
        };
        if let Ok(mut map) = self.descriptors.lock() {
            map.insert(pid, descriptor);
        }
    }

    /// Removes the dead pid's descriptor, returning it with the exit
    /// code filled in for logging.
    fn retire(&self, pid: u32, exit_code: Option<i32>) -> Option<WorkerDescriptor> {
        let removed = match self.descriptors.lock() {
            Ok(mut map) => map.remove(&pid),
            Err(poisoned) => poisoned.into_inner().remove(&pid),
        };
        removed.map(|mut descriptor| {
            descriptor.exit_code = exit_code;
            descriptor
        })
    }

    /// Spawns one worker and its supervision task, retrying failed
    /// spawns until one sticks or shutdown begins. The pool size is an
    /// invariant; a transient fork failure must not shrink it.
    async fn launch(&self, set: &mut JoinSet<WorkerExit>, cancel_token: &CancellationToken) {
        loop {
            match self.spawner.spawn_worker().await {
                Ok(mut child) => {
                    let pid = child.pid();
                    self.record_spawn(pid);
                    info!(pid, "Worker spawned");

                    let cancel = cancel_token.clone();
                    set.spawn(async move {
                        tokio::select! {
                            biased;

                            _ = cancel.cancelled() => {
                                child.kill().await;
                                // Reap after kill so no zombie is left behind
                                let _ = child.wait().await;
                                WorkerExit::Shutdown { pid }
                            }

                            exit_code = child.wait() => {
                                WorkerExit::Crashed { pid, exit_code }
                            }
                        }
                    });
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Could not spawn worker, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => return,
                        _ = sleep(SPAWN_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Runs the pool until the token is cancelled and every worker is gone.
    pub async fn run(&self, cancel_token: CancellationToken) {
        info!(size = self.size, "Worker pool starting");

        let mut set = JoinSet::new();
        for _ in 0..self.size {
            self.launch(&mut set, &cancel_token).await;
        }

        while let Some(joined) = set.join_next().await {
            let exit = match joined {
                Ok(exit) => exit,
                Err(e) => {
                    error!(error = %e, "Worker supervision task aborted");
                    continue;
                }
            };

            match exit {
                WorkerExit::Shutdown { pid } => {
                    self.retire(pid, Some(0));
                    debug!(pid, "Worker stopped for shutdown");
                }
                WorkerExit::Crashed { pid, exit_code } => {
                    let retired = self.retire(pid, exit_code);
                    if cancel_token.is_cancelled() {
                        debug!(pid, "Worker exited during shutdown");
                        continue;
                    }
                    let uptime_secs = retired
                        .map(|d| (Utc::now() - d.spawned_at).num_seconds())
                        .unwrap_or(0);
                    warn!(
                        pid,
                        exit_code = exit_code.unwrap_or(-1),
                        uptime_secs,
                        "Worker exited, respawning"
                    );
                    self.launch(&mut set, &cancel_token).await;
                }
            }
        }

        info!("Worker pool stopped");
    }
}
