//! Outbound job processing.
//!
//! An optional loop that drains queued outbound messages and hands them
//! to live sessions. The queue itself is a collaborator boundary; the
//! bundled `SpoolQueue` is a durable directory spool of JSON job files.
//! The processor is strictly best-effort: it only runs when a spool is
//! configured, starts after tenant bring-up, and no queue failure ever
//! takes the process down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::SessionKey;

use crate::registry::RegistryHandle;

/// How often the processor polls an empty queue.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spool subdirectory holding delivered jobs.
const SENT_DIR: &str = "sent";

/// One queued outbound message, addressed to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundJob {
    #[serde(default)]
    pub id: String,
    pub key: SessionKey,
    pub payload: serde_json::Value,
}

/// Errors from the outbound queue collaborator.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io: {0}")]
    Io(String),

    #[error("malformed job {0}")]
    Malformed(String),
}

/// Source and sink for outbound jobs.
#[async_trait]
pub trait OutboundQueue: Send + 'static {
    /// Takes the next job out of the queue; `None` when empty.
    async fn next_job(&mut self) -> Result<Option<OutboundJob>, QueueError>;

    /// Delivers one job taken from the queue.
    async fn deliver(&mut self, job: &OutboundJob) -> Result<(), QueueError>;
}

/// Durable directory spool: one pending job per `*.json` file, processed
/// in file-name order; delivered jobs move to `sent/`, malformed files
/// are renamed to `*.bad` so they cannot wedge the loop.
pub struct SpoolQueue {
    dir: PathBuf,
}

impl SpoolQueue {
    /// Opens the spool, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// `QueueError::Io` when the directory cannot be created.
    pub async fn open(dir: &Path) -> Result<Self, QueueError> {
        tokio::fs::create_dir_all(dir.join(SENT_DIR))
            .await
            .map_err(|e| QueueError::Io(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    async fn oldest_pending(&self) -> Result<Option<PathBuf>, QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;

        let mut oldest: Option<PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if oldest.as_ref().map_or(true, |o| path < *o) {
                oldest = Some(path);
            }
        }
        Ok(oldest)
    }
}

#[async_trait]
impl OutboundQueue for SpoolQueue {
    async fn next_job(&mut self) -> Result<Option<OutboundJob>, QueueError> {
        let Some(path) = self.oldest_pending().await? else {
            return Ok(None);
        };

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;

        let parsed: Result<OutboundJob, _> = serde_json::from_str(&raw);
        let mut job = match parsed {
            Ok(job) => job,
            Err(e) => {
                // Quarantine the file so the next poll moves on
                let _ = tokio::fs::rename(&path, path.with_extension("bad")).await;
                return Err(QueueError::Malformed(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        };

        if job.id.is_empty() {
            job.id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("job")
                .to_string();
        }

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        Ok(Some(job))
    }

    async fn deliver(&mut self, job: &OutboundJob) -> Result<(), QueueError> {
        let archived = self.dir.join(SENT_DIR).join(format!("{}.json", job.id));
        let raw =
            serde_json::to_vec_pretty(job).map_err(|e| QueueError::Malformed(e.to_string()))?;
        tokio::fs::write(&archived, raw)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        debug!(job = %job.id, session = %job.key, "Outbound job delivered");
        Ok(())
    }
}

/// Spawns the outbound processing loop.
///
/// Jobs addressed to a session with no live registry entry are skipped
/// with a warning; every queue error is logged and the loop continues.
pub fn spawn_outbound_processor(
    mut queue: impl OutboundQueue,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Outbound processor started");
        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Outbound processor shutting down");
                    break;
                }

                next = queue.next_job() => {
                    match next {
                        Ok(Some(job)) => process_job(&mut queue, &registry, job).await,
                        Ok(None) => sleep(POLL_INTERVAL).await,
                        Err(e) => {
                            warn!(error = %e, "Could not fetch outbound job");
                            sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
        }
    })
}

async fn process_job(queue: &mut impl OutboundQueue, registry: &RegistryHandle, job: OutboundJob) {
    let live = registry
        .get(job.key)
        .await
        .is_some_and(|s| !s.status.is_stopped());

    if !live {
        warn!(job = %job.id, session = %job.key, "No live session for outbound job, skipping");
        return;
    }

    if let Err(e) = queue.deliver(&job).await {
        warn!(job = %job.id, session = %job.key, error = %e, "Outbound delivery failed");
    }
}
