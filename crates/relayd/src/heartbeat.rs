//! Liveness heartbeat file.
//!
//! In production mode each worker overwrites `heartbeat.txt` in the log
//! directory with the current timestamp so external watchdogs can detect
//! a wedged process without talking to it. Write failures are logged and
//! the loop keeps going.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heartbeat file name inside the log directory.
pub const HEARTBEAT_FILE: &str = "heartbeat.txt";

/// How often the heartbeat is refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the heartbeat task writing to `<log_dir>/heartbeat.txt`.
pub fn spawn_heartbeat_task(
    log_dir: PathBuf,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let path = log_dir.join(HEARTBEAT_FILE);
        let mut tick = interval(HEARTBEAT_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(path = %path.display(), "Heartbeat started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Heartbeat shutting down");
                    break;
                }

                // First tick fires immediately, so the file exists as
                // soon as the worker is up.
                _ = tick.tick() => {
                    beat(&path).await;
                }
            }
        }
    })
}

async fn beat(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %path.display(), error = %e, "Could not create heartbeat directory");
            return;
        }
    }

    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match tokio::fs::write(path, stamp.as_bytes()).await {
        Ok(()) => debug!(stamp = %stamp, "Heartbeat written"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not write heartbeat"),
    }
}
