//! Health monitoring for the relay daemon.
//!
//! Samples resident memory of the current process on a fixed interval and
//! reports a preventive-restart fault when it crosses the configured
//! threshold. The monitor only observes and reports; acting on the fault
//! (restart, exit) is the recovery controller's job.

use std::process;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::Fault;

use crate::faults::FaultSender;

/// Default resident-memory threshold: 1.5 GiB.
pub const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 3 * 512 * 1024 * 1024;

/// Default sampling interval.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of resident-memory samples for the current process.
///
/// `None` means the sample could not be taken this tick; the monitor logs
/// and moves on.
pub trait MemoryProbe: Send + 'static {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// `sysinfo`-backed probe for the current process.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        self.system.refresh_all();
        self.system.process(self.pid).map(|p| p.memory())
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub memory_threshold_bytes: u64,
    pub check_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }
}

/// Spawns the health monitoring task.
///
/// Each tick samples resident memory; a breach reports exactly one
/// `ResourceThreshold` fault for that tick. Uses cooperative shutdown via
/// CancellationToken.
pub fn spawn_monitor_task(
    mut probe: impl MemoryProbe,
    settings: MonitorSettings,
    faults: FaultSender,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(settings.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so the initial sample
        // lands one full interval after startup.
        tick.tick().await;

        info!(
            threshold_bytes = settings.memory_threshold_bytes,
            interval_secs = settings.check_interval.as_secs(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Health monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    check_once(&mut probe, &settings, &faults).await;
                }
            }
        }

        debug!("Health monitor task completed");
    })
}

async fn check_once(
    probe: &mut impl MemoryProbe,
    settings: &MonitorSettings,
    faults: &FaultSender,
) {
    let Some(resident) = probe.resident_bytes() else {
        warn!("Memory sample unavailable, skipping health check");
        return;
    };

    if resident > settings.memory_threshold_bytes {
        warn!(
            resident_bytes = resident,
            threshold_bytes = settings.memory_threshold_bytes,
            "HIGH MEMORY: resident set above threshold, requesting preventive restart"
        );
        faults
            .report(Fault::resource_threshold(
                "resident memory above threshold",
                format!(
                    "resident={resident} threshold={}",
                    settings.memory_threshold_bytes
                ),
            ))
            .await;
    } else {
        debug!(
            resident_bytes = resident,
            threshold_bytes = settings.memory_threshold_bytes,
            "Health check passed"
        );
    }
}
