//! Durable crash records.
//!
//! Every fault that reaches the recovery dispatcher is appended to
//! `crash.log` in the log directory before any recovery action runs, so
//! the trail survives the restart that may follow. Each record goes out
//! in a single `write_all` on an append-mode handle, which keeps records
//! from interleaving when several processes share the file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use relay_core::{CrashRecord, Fault};

/// File name of the crash log inside the log directory.
pub const CRASH_LOG_FILE: &str = "crash.log";

/// Appends crash records to the durable crash log.
#[derive(Debug, Clone)]
pub struct CrashRecorder {
    path: PathBuf,
}

impl CrashRecorder {
    /// Creates a recorder writing to `<log_dir>/crash.log`. The directory
    /// is created on first write, not here.
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(CRASH_LOG_FILE),
        }
    }

    /// Records one fault. Failures are logged and swallowed: the crash
    /// log must never take the recovery path down with it.
    pub async fn record(&self, fault: &Fault) {
        let record = CrashRecord::from_fault(fault);
        if let Err(e) = self.append(&record).await {
            error!(
                path = %self.path.display(),
                error = %e,
                "Could not write crash record"
            );
        } else {
            debug!(origin = %fault.origin, "Crash record written");
        }
    }

    async fn append(&self, record: &CrashRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        // One write_all per record keeps concurrent appenders from
        // interleaving inside a record.
        file.write_all(record.render().as_bytes()).await?;
        file.flush().await
    }
}
