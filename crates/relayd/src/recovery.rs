//! Fault routing and recovery.
//!
//! The dispatcher owns the receiving end of the process-wide fault
//! channel. Every fault is written to the crash log first, then routed by
//! origin: process faults and resource-threshold breaches escalate to a
//! process restart, session faults trigger an in-process reconnect pass.
//!
//! Restart escalation is two-tier: ask the external supervisor to restart
//! us; when that request itself fails, fall back to a delayed
//! self-termination so the supervisor restarts the exited process instead.
//! The fallback fires at half the restart delay, landing inside the
//! `[restart_delay / 2, restart_delay]` window after the failure is
//! observed. A restart request the supervisor accepted never terminates
//! the process from here; the supervisor owns the restart from then on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::Fault;

use crate::recorder::CrashRecorder;
use crate::starter::SessionStarter;
use crate::tenants::TenantDirectory;

/// Default delay before the fallback self-termination.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Default wait before a session-fault reconnect pass begins.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(10);

/// Default pause between tenants within a reconnect pass.
pub const DEFAULT_RECOVERY_PAUSE: Duration = Duration::from_secs(5);

/// Default restart command handed to the external supervisor.
pub const DEFAULT_RESTART_COMMAND: &str = "pm2 restart all";

/// Errors from the external restart request.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("restart command failed: {0}")]
    Command(String),
}

/// Requests a process restart from whatever supervises this process.
///
/// Must be idempotent; the dispatcher may only ever call it once per
/// process lifetime, but the supervisor side cannot rely on that.
#[async_trait]
pub trait ProcessManager: Send + Sync + 'static {
    async fn request_restart(&self) -> Result<(), RestartError>;
}

/// Runs the configured restart command through the shell.
pub struct SystemProcessManager {
    command: String,
}

impl SystemProcessManager {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn request_restart(&self) -> Result<(), RestartError> {
        info!(command = %self.command, "Requesting external restart");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status()
            .await
            .map_err(|e| RestartError::Command(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(RestartError::Command(format!(
                "exited with {status}"
            )))
        }
    }
}

/// Last-resort process termination seam.
pub trait Terminate: Send + Sync + 'static {
    fn terminate(&self);
}

/// Terminates the current process with a non-zero code so the supervisor
/// sees a failure exit.
pub struct ProcessExit;

impl Terminate for ProcessExit {
    fn terminate(&self) {
        std::process::exit(1);
    }
}

/// Recovery timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    pub restart_delay: Duration,
    pub recovery_delay: Duration,
    pub recovery_pause: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RESTART_DELAY,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            recovery_pause: DEFAULT_RECOVERY_PAUSE,
        }
    }
}

/// Routes recorded faults to restart escalation or session recovery.
#[derive(Clone)]
pub struct RecoveryController {
    process_manager: Arc<dyn ProcessManager>,
    terminate: Arc<dyn Terminate>,
    starter: SessionStarter,
    directory: Arc<dyn TenantDirectory>,
    recorder: CrashRecorder,
    settings: RecoverySettings,
    exit_armed: Arc<AtomicBool>,
    pass_in_flight: Arc<AtomicBool>,
}

impl RecoveryController {
    pub fn new(
        process_manager: Arc<dyn ProcessManager>,
        terminate: Arc<dyn Terminate>,
        starter: SessionStarter,
        directory: Arc<dyn TenantDirectory>,
        recorder: CrashRecorder,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            process_manager,
            terminate,
            starter,
            directory,
            recorder,
            settings,
            exit_armed: Arc::new(AtomicBool::new(false)),
            pass_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the dispatcher task owning the fault channel receiver.
    pub fn spawn_dispatcher(
        self,
        mut faults: mpsc::Receiver<Fault>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Recovery dispatcher started");
            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        info!("Recovery dispatcher shutting down");
                        break;
                    }

                    fault = faults.recv() => {
                        let Some(fault) = fault else {
                            debug!("Fault channel closed");
                            break;
                        };
                        self.dispatch(fault).await;
                    }
                }
            }
        })
    }

    async fn dispatch(&self, fault: Fault) {
        // Record first so the trail survives whatever recovery does next.
        self.recorder.record(&fault).await;

        if fault.origin.is_fatal() {
            self.handle_fatal(&fault).await;
        } else {
            self.handle_session_fault(&fault);
        }
    }

    /// Escalates a fatal fault to a process restart.
    ///
    /// Escalates at most once per process lifetime; later fatal faults
    /// are recorded but otherwise ignored, the restart is already
    /// underway. Self-termination is armed only when the restart request
    /// itself fails, so an accepted request leaves the shutdown to the
    /// supervisor.
    async fn handle_fatal(&self, fault: &Fault) {
        if self.exit_armed.swap(true, Ordering::SeqCst) {
            warn!(origin = %fault.origin, "Restart already pending, ignoring fatal fault");
            return;
        }

        error!(
            origin = %fault.origin,
            message = %fault.message,
            "Fatal fault, escalating to process restart"
        );

        if let Err(e) = self.process_manager.request_restart().await {
            error!(error = %e, "Restart request failed, falling back to self-termination");
            let terminate = self.terminate.clone();
            let delay = self.settings.restart_delay;
            tokio::spawn(async move {
                sleep(delay / 2).await;
                warn!("Terminating so the supervisor can bring up a fresh process");
                terminate.terminate();
            });
        }
    }

    /// Schedules a session reconnect pass.
    ///
    /// At most one pass runs at a time; the pass is strictly sequential
    /// across tenants with a pause between them so the external network
    /// never sees a reconnect storm.
    fn handle_session_fault(&self, fault: &Fault) {
        if self.pass_in_flight.swap(true, Ordering::SeqCst) {
            debug!(message = %fault.message, "Recovery pass already in flight, skipping");
            return;
        }

        warn!(
            message = %fault.message,
            delay_secs = self.settings.recovery_delay.as_secs(),
            "Session fault, scheduling reconnect pass"
        );

        let controller = self.clone();
        tokio::spawn(async move {
            sleep(controller.settings.recovery_delay).await;
            controller.run_recovery_pass().await;
            controller.pass_in_flight.store(false, Ordering::SeqCst);
        });
    }

    async fn run_recovery_pass(&self) {
        let tenants = match self.directory.fetch_active_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                // Abandons this cycle only; the next session fault
                // schedules a fresh pass.
                error!(error = %e, "Reconnect pass could not fetch tenants, abandoning cycle");
                return;
            }
        };

        info!(tenants = tenants.len(), "Reconnect pass started");

        for tenant in tenants {
            let report = self.starter.start_all_for_tenant(tenant.id).await;
            if let Some(fetch_error) = &report.fetch_error {
                warn!(tenant = %tenant.id, error = %fetch_error, "Tenant skipped in reconnect pass");
            } else if report.errored_count() > 0 {
                warn!(
                    tenant = %tenant.id,
                    errored = report.errored_count(),
                    "Tenant partially reconnected"
                );
            }
            sleep(self.settings.recovery_pause).await;
        }

        info!("Reconnect pass complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChannelEvent, ChannelLink, Connector};
    use crate::faults::fault_channel;
    use crate::registry::spawn_registry;
    use crate::session::SessionSettings;
    use crate::tenants::{StaticDirectory, TenantRecord};
    use relay_core::{ChannelConfig, StartError, TenantId};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct StubManager {
        succeed: bool,
        calls: AtomicUsize,
    }

    impl StubManager {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessManager for StubManager {
        async fn request_restart(&self) -> Result<(), RestartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(RestartError::Command("supervisor unreachable".into()))
            }
        }
    }

    #[derive(Default)]
    struct RecordingTerminate {
        fired_at: Mutex<Option<Instant>>,
    }

    impl Terminate for RecordingTerminate {
        fn terminate(&self) {
            let mut fired = match self.fired_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            fired.get_or_insert(Instant::now());
        }
    }

    #[derive(Default)]
    struct StubConnector {
        held: Mutex<Vec<tokio::sync::mpsc::Sender<ChannelEvent>>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(
            &self,
            _tenant: TenantId,
            _config: &ChannelConfig,
        ) -> Result<ChannelLink, StartError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            if let Ok(mut held) = self.held.lock() {
                held.push(tx);
            }
            Ok(ChannelLink::new(rx))
        }
    }

    struct Fixture {
        controller: RecoveryController,
        manager: Arc<StubManager>,
        terminate: Arc<RecordingTerminate>,
        connector: Arc<StubConnector>,
        registry: crate::registry::RegistryHandle,
        _log_dir: tempfile::TempDir,
    }

    fn fixture(restart_ok: bool, records: Vec<TenantRecord>) -> Fixture {
        let registry = spawn_registry();
        let (fault_sender, _fault_rx) = fault_channel();
        let directory: Arc<StaticDirectory> = Arc::new(StaticDirectory::new(records));
        let connector = Arc::new(StubConnector::default());
        let starter = SessionStarter::new(
            registry.clone(),
            directory.clone(),
            connector.clone(),
            fault_sender,
            SessionSettings::default(),
        );
        let manager = Arc::new(StubManager::new(restart_ok));
        let terminate = Arc::new(RecordingTerminate::default());
        let log_dir = tempfile::tempdir().expect("temp dir");
        let controller = RecoveryController::new(
            manager.clone(),
            terminate.clone(),
            starter,
            directory,
            CrashRecorder::new(log_dir.path()),
            RecoverySettings {
                restart_delay: Duration::from_secs(5),
                recovery_delay: Duration::from_secs(10),
                recovery_pause: Duration::from_secs(5),
            },
        );
        Fixture {
            controller,
            manager,
            terminate,
            connector,
            registry,
            _log_dir: log_dir,
        }
    }

    fn one_tenant() -> Vec<TenantRecord> {
        vec![TenantRecord {
            tenant: TenantId::new(1),
            channels: vec![ChannelConfig::new(1, "gw:9300")],
        }]
    }

    /// Spins without parking the runtime, so the paused clock cannot
    /// auto-advance while the dispatcher is still recording the fault
    /// (crash-log writes run on the real blocking pool).
    async fn spin_until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..5_000 {
            if check() {
                return;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out spinning for {what}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_restart_request_never_self_terminates() {
        let fx = fixture(true, one_tenant());
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        faults.report(Fault::process("uncaught", "stack")).await;
        spin_until("restart request", || {
            fx.manager.calls.load(Ordering::SeqCst) == 1
        })
        .await;

        // The supervisor accepted the restart; waiting well past the
        // restart delay must not trip the fallback.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.terminate.fired_at.lock().expect("lock").is_none());
        assert_eq!(fx.manager.calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_terminates_within_half_delay() {
        let fx = fixture(false, one_tenant());
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        let start = Instant::now();
        faults
            .report(Fault::resource_threshold("memory", "2GiB"))
            .await;
        spin_until("restart request", || {
            fx.manager.calls.load(Ordering::SeqCst) == 1
        })
        .await;
        tokio::time::sleep(Duration::from_secs(8)).await;

        let fired = fx
            .terminate
            .fired_at
            .lock()
            .expect("lock")
            .expect("terminate fired");
        let elapsed = fired - start;
        assert!(elapsed >= Duration::from_millis(2500));
        assert!(elapsed <= Duration::from_secs(5));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_fatal_fault_is_ignored_while_pending() {
        let fx = fixture(true, one_tenant());
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        faults.report(Fault::process("first", "")).await;
        faults.report(Fault::process("second", "")).await;

        // Both faults are still recorded; only the first escalates.
        let crash_log = fx._log_dir.path().join("crash.log");
        spin_until("both faults recorded", || {
            std::fs::read_to_string(&crash_log)
                .map(|log| log.contains("second"))
                .unwrap_or(false)
        })
        .await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert_eq!(fx.manager.calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_fault_reconnects_after_recovery_delay() {
        let fx = fixture(true, one_tenant());
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        faults
            .report(Fault::session("channel lost", "gw:9300"))
            .await;

        // Nothing happens before the recovery delay elapses.
        spin_until("pass scheduled", || {
            fx.controller.pass_in_flight.load(Ordering::SeqCst)
        })
        .await;
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.list_active().await.len(), 1);

        // No restart escalation for session faults.
        assert_eq!(fx.manager.calls.load(Ordering::SeqCst), 0);
        assert!(fx.terminate.fired_at.lock().expect("lock").is_none());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_recovery_pass_in_flight() {
        let fx = fixture(true, one_tenant());
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        faults.report(Fault::session("first", "")).await;
        faults.report(Fault::session("second", "")).await;

        // Hold the clock until the dispatcher has seen both faults.
        let crash_log = fx._log_dir.path().join("crash.log");
        spin_until("both faults recorded", || {
            std::fs::read_to_string(&crash_log)
                .map(|log| log.contains("second"))
                .unwrap_or(false)
        })
        .await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Both faults land while one pass is pending; only one pass runs,
        // and the idempotent restart leaves a single live session.
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_pass_is_sequential_across_tenants() {
        let records = (1..=3u64)
            .map(|id| TenantRecord {
                tenant: TenantId::new(id),
                channels: vec![ChannelConfig::new(1, "gw:9300")],
            })
            .collect();
        let fx = fixture(true, records);
        let (faults, rx) = fault_channel();
        let cancel = CancellationToken::new();
        fx.controller.clone().spawn_dispatcher(rx, cancel.clone());

        let start = Instant::now();
        faults.report(Fault::session("lost", "")).await;
        spin_until("pass scheduled", || {
            fx.controller.pass_in_flight.load(Ordering::SeqCst)
        })
        .await;

        // 10s delay + 3 tenants with a 5s pause after each.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fx.registry.list_active().await.len(), 3);
        assert!(Instant::now() - start >= Duration::from_secs(25));
        cancel.cancel();
    }
}
