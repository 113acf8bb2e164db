//! End-to-end supervision tests.
//!
//! These tests wire the real components together - registry, sessions,
//! starter, fault channel, crash recorder, recovery controller - with
//! only the process-boundary collaborators (connector, process manager,
//! termination) replaced by test doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{ChannelConfig, Fault, SessionKey, SessionStatus, StartError, TenantId};
use relayd::connector::{ChannelEvent, ChannelLink, Connector};
use relayd::faults::fault_channel;
use relayd::outbound::{spawn_outbound_processor, OutboundJob, SpoolQueue};
use relayd::recorder::CrashRecorder;
use relayd::recovery::{
    ProcessManager, RecoveryController, RecoverySettings, RestartError, Terminate,
};
use relayd::registry::spawn_registry;
use relayd::session::SessionSettings;
use relayd::starter::SessionStarter;
use relayd::tenants::{StaticDirectory, TenantRecord};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Doubles
// ============================================================================

/// Connector with a switchable accept flag; accepted links stay open
/// until their sender is dropped.
#[derive(Default)]
struct SwitchedConnector {
    accept: AtomicBool,
    connects: AtomicUsize,
    held: Mutex<Vec<tokio::sync::mpsc::Sender<ChannelEvent>>>,
}

impl SwitchedConnector {
    fn accepting() -> Self {
        let connector = Self::default();
        connector.accept.store(true, Ordering::SeqCst);
        connector
    }

    fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Drops every held link sender, disconnecting all live sessions.
    fn drop_links(&self) {
        if let Ok(mut held) = self.held.lock() {
            held.clear();
        }
    }

    async fn send_ready_all(&self) {
        let senders = match self.held.lock() {
            Ok(held) => held.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for sender in senders {
            let _ = sender.send(ChannelEvent::Ready).await;
        }
    }
}

#[async_trait]
impl Connector for SwitchedConnector {
    async fn connect(
        &self,
        _tenant: TenantId,
        _config: &ChannelConfig,
    ) -> Result<ChannelLink, StartError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.accept.load(Ordering::SeqCst) {
            return Err(StartError::ChannelUnreachable("refused".into()));
        }
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        if let Ok(mut held) = self.held.lock() {
            held.push(tx);
        }
        Ok(ChannelLink::new(rx))
    }
}

struct StubManager {
    succeed: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl ProcessManager for StubManager {
    async fn request_restart(&self) -> Result<(), RestartError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(())
        } else {
            Err(RestartError::Command("no supervisor".into()))
        }
    }
}

#[derive(Default)]
struct FlagTerminate {
    fired: AtomicBool,
}

impl Terminate for FlagTerminate {
    fn terminate(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Fixture
// ============================================================================

fn one_tenant_records() -> Vec<TenantRecord> {
    vec![TenantRecord {
        tenant: TenantId::new(1),
        channels: vec![ChannelConfig::new(1, "gw:9300")],
    }]
}

fn fast_settings() -> SessionSettings {
    SessionSettings {
        reconnect_delay: Duration::from_millis(10),
        retry_ceiling: 1,
    }
}

fn fast_recovery() -> RecoverySettings {
    RecoverySettings {
        restart_delay: Duration::from_millis(100),
        recovery_delay: Duration::from_millis(300),
        recovery_pause: Duration::from_millis(10),
    }
}

async fn wait_for_status<F>(registry: &relayd::registry::RegistryHandle, key: SessionKey, pred: F)
where
    F: Fn(Option<SessionStatus>) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if pred(registry.get(key).await.map(|s| s.status)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for session status");
}

async fn wait_for_flag<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ============================================================================
// Session Failure -> Recovery Pass
// ============================================================================

#[tokio::test]
async fn test_failed_session_is_recovered_after_session_fault() {
    let log_dir = tempfile::tempdir().expect("temp dir");
    let registry = spawn_registry();
    let (fault_sender, fault_receiver) = fault_channel();
    let directory = Arc::new(StaticDirectory::new(one_tenant_records()));
    let connector = Arc::new(SwitchedConnector::accepting());

    let starter = SessionStarter::new(
        registry.clone(),
        directory.clone(),
        connector.clone(),
        fault_sender.clone(),
        fast_settings(),
    );

    let controller = RecoveryController::new(
        Arc::new(StubManager {
            succeed: true,
            calls: AtomicUsize::new(0),
        }),
        Arc::new(FlagTerminate::default()),
        starter.clone(),
        directory,
        CrashRecorder::new(log_dir.path()),
        fast_recovery(),
    );
    let cancel = CancellationToken::new();
    controller.spawn_dispatcher(fault_receiver, cancel.clone());

    // Bring the tenant up and let the session connect.
    let report = starter.start_all_for_tenant(TenantId::new(1)).await;
    assert_eq!(report.started_count(), 1);
    connector.send_ready_all().await;

    let key = SessionKey::new(1, 1);
    wait_for_status(&registry, key, |s| s == Some(SessionStatus::Connected)).await;

    // Kill the channel and refuse reconnects until the ceiling trips.
    connector.set_accepting(false);
    connector.drop_links();

    wait_for_status(&registry, key, |s| s == Some(SessionStatus::Failed)).await;

    // Let the scheduled recovery pass find a healthy network.
    connector.set_accepting(true);

    wait_for_status(&registry, key, |s| {
        s.map(|status| !status.is_terminal()).unwrap_or(false)
    })
    .await;

    // The fault made it to the durable crash log before recovery ran.
    let crash_log = tokio::fs::read_to_string(log_dir.path().join("crash.log"))
        .await
        .expect("crash log");
    assert!(crash_log.contains("session-fault"));

    cancel.cancel();
}

// ============================================================================
// Fatal Fault -> Restart Escalation
// ============================================================================

#[tokio::test]
async fn test_fatal_fault_records_and_escalates() {
    let log_dir = tempfile::tempdir().expect("temp dir");
    let registry = spawn_registry();
    let (fault_sender, fault_receiver) = fault_channel();
    let directory = Arc::new(StaticDirectory::default());
    let connector = Arc::new(SwitchedConnector::accepting());

    let starter = SessionStarter::new(
        registry,
        directory.clone(),
        connector,
        fault_sender.clone(),
        fast_settings(),
    );

    let manager = Arc::new(StubManager {
        succeed: false,
        calls: AtomicUsize::new(0),
    });
    let terminate = Arc::new(FlagTerminate::default());
    let controller = RecoveryController::new(
        manager.clone(),
        terminate.clone(),
        starter,
        directory,
        CrashRecorder::new(log_dir.path()),
        fast_recovery(),
    );
    let cancel = CancellationToken::new();
    controller.spawn_dispatcher(fault_receiver, cancel.clone());

    fault_sender
        .report(Fault::resource_threshold(
            "resident memory above threshold",
            "resident=2147483648 threshold=1610612736",
        ))
        .await;

    wait_for_flag("restart requested", || {
        manager.calls.load(Ordering::SeqCst) == 1
    })
    .await;

    // The failed restart request escalates to self-termination.
    wait_for_flag("terminate fired", || terminate.fired.load(Ordering::SeqCst)).await;

    let crash_log = tokio::fs::read_to_string(log_dir.path().join("crash.log"))
        .await
        .expect("crash log");
    assert!(crash_log.contains("resource-threshold: resident memory above threshold"));

    cancel.cancel();
}

// ============================================================================
// Outbound Jobs Against Live Sessions
// ============================================================================

#[tokio::test]
async fn test_outbound_job_delivered_to_live_session() {
    let spool_dir = tempfile::tempdir().expect("temp dir");
    let registry = spawn_registry();
    let (fault_sender, _fault_receiver) = fault_channel();
    let directory = Arc::new(StaticDirectory::new(one_tenant_records()));
    let connector = Arc::new(SwitchedConnector::accepting());

    let starter = SessionStarter::new(
        registry.clone(),
        directory,
        connector,
        fault_sender,
        fast_settings(),
    );
    let report = starter.start_all_for_tenant(TenantId::new(1)).await;
    assert_eq!(report.started_count(), 1);

    // Spool one job for the live session and one for nobody.
    let queue = SpoolQueue::open(spool_dir.path()).await.expect("spool");
    let live = OutboundJob {
        id: "m1".into(),
        key: SessionKey::new(1, 1),
        payload: serde_json::json!({"text": "hello"}),
    };
    let orphan = OutboundJob {
        id: "m2".into(),
        key: SessionKey::new(9, 9),
        payload: serde_json::json!({"text": "nobody"}),
    };
    tokio::fs::write(
        spool_dir.path().join("0001.json"),
        serde_json::to_vec(&live).expect("json"),
    )
    .await
    .expect("write job");
    tokio::fs::write(
        spool_dir.path().join("0002.json"),
        serde_json::to_vec(&orphan).expect("json"),
    )
    .await
    .expect("write job");

    let cancel = CancellationToken::new();
    spawn_outbound_processor(queue, registry, cancel.clone());

    let sent = spool_dir.path().join("sent/m1.json");
    wait_for_flag("job delivered", || sent.exists()).await;

    // The orphan job was consumed but never archived.
    assert!(!spool_dir.path().join("sent/m2.json").exists());
    cancel.cancel();
}
