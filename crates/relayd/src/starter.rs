//! Session bring-up orchestration.
//!
//! The starter attempts every configured channel for a tenant and reports
//! per-channel outcomes instead of failing as a whole: one misconfigured
//! channel must never block its siblings, and one broken tenant must
//! never block the rest of the fleet. Tenant starts run concurrently in a
//! `JoinSet`; the recovery controller reuses `start_all_for_tenant` for
//! its deliberately-sequential recovery pass.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use relay_core::{ChannelConfig, ChannelId, Fault, SessionKey, SessionStatus, TenantId};

use crate::connector::Connector;
use crate::faults::FaultSender;
use crate::registry::RegistryHandle;
use crate::session::{SessionHandle, SessionSettings};
use crate::tenants::TenantDirectory;

/// Result of one channel's bring-up attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session is up or already was (idempotent bring-up).
    Started,

    /// The attempt failed; the reason is operator-facing.
    Errored(String),
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Per-channel outcome within a tenant report.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel: ChannelId,
    pub outcome: StartOutcome,
}

/// Outcome report for one tenant's bring-up.
///
/// Never represents an overall failure: a channel-list fetch error is
/// carried in `fetch_error` with zero outcomes, and the orchestration
/// level still "succeeds".
#[derive(Debug, Clone)]
pub struct TenantStartReport {
    pub tenant: TenantId,
    pub outcomes: Vec<ChannelOutcome>,
    pub fetch_error: Option<String>,
}

impl TenantStartReport {
    pub fn started_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome.is_started())
            .count()
    }

    pub fn errored_count(&self) -> usize {
        self.outcomes.len() - self.started_count()
    }
}

/// Orchestrates session bring-up for tenants.
///
/// All collaborators are injected; the starter holds no state of its own
/// and is cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct SessionStarter {
    registry: RegistryHandle,
    directory: Arc<dyn TenantDirectory>,
    connector: Arc<dyn Connector>,
    faults: FaultSender,
    settings: SessionSettings,
}

impl SessionStarter {
    pub fn new(
        registry: RegistryHandle,
        directory: Arc<dyn TenantDirectory>,
        connector: Arc<dyn Connector>,
        faults: FaultSender,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry,
            directory,
            connector,
            faults,
            settings,
        }
    }

    /// Attempts every channel configured for one tenant.
    ///
    /// Never fails as a whole; the report carries one outcome per channel.
    pub async fn start_all_for_tenant(&self, tenant: TenantId) -> TenantStartReport {
        let channels = match self.directory.channels_for(tenant).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Could not fetch channel configs");
                return TenantStartReport {
                    tenant,
                    outcomes: Vec::new(),
                    fetch_error: Some(e.to_string()),
                };
            }
        };

        let mut outcomes = Vec::with_capacity(channels.len());
        for config in channels {
            outcomes.push(self.start_channel(tenant, config).await);
        }

        let report = TenantStartReport {
            tenant,
            outcomes,
            fetch_error: None,
        };

        info!(
            tenant = %tenant,
            started = report.started_count(),
            errored = report.errored_count(),
            "Tenant session bring-up finished"
        );

        report
    }

    /// Brings up one channel, idempotently.
    ///
    /// A live occupant of the key counts as `Started`; a `Failed`
    /// occupant is explicitly released first so recovery passes only
    /// ever touch broken sessions.
    async fn start_channel(&self, tenant: TenantId, config: ChannelConfig) -> ChannelOutcome {
        let channel = config.id;
        let key = SessionKey {
            tenant,
            channel,
        };

        if let Some(snapshot) = self.registry.get(key).await {
            match snapshot.status {
                SessionStatus::Failed => {
                    debug!(session = %key, "Releasing failed session before restart");
                    self.registry.stop(key).await;
                }
                SessionStatus::Stopped => {
                    // A lingering Stopped entry is replaced by register
                }
                _ => {
                    debug!(session = %key, status = %snapshot.status, "Session already active");
                    return ChannelOutcome {
                        channel,
                        outcome: StartOutcome::Started,
                    };
                }
            }
        }

        match SessionHandle::start(
            key,
            config,
            self.connector.clone(),
            self.registry.clone(),
            self.faults.clone(),
            self.settings,
        )
        .await
        {
            Ok(_handle) => ChannelOutcome {
                channel,
                outcome: StartOutcome::Started,
            },
            Err(e) => {
                warn!(session = %key, error = %e, "Session start failed");
                ChannelOutcome {
                    channel,
                    outcome: StartOutcome::Errored(e.to_string()),
                }
            }
        }
    }

    /// Brings up sessions for every active tenant, concurrently.
    ///
    /// A tenant-set fetch failure is reported as a session fault (the
    /// recovery controller will re-attempt) and yields an empty result;
    /// the call itself always succeeds.
    pub async fn start_all_active_tenants(&self) -> Vec<TenantStartReport> {
        let tenants = match self.directory.fetch_active_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Could not fetch active tenants");
                self.faults
                    .report(Fault::session(
                        "failed to fetch the active tenant set",
                        e.to_string(),
                    ))
                    .await;
                return Vec::new();
            }
        };

        info!(count = tenants.len(), "Active tenants fetched");

        let mut set = JoinSet::new();
        for tenant in tenants {
            let starter = self.clone();
            set.spawn(async move { starter.start_all_for_tenant(tenant.id).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Tenant bring-up task aborted"),
            }
        }

        info!(
            tenants = reports.len(),
            sessions_started = reports.iter().map(|r| r.started_count()).sum::<usize>(),
            sessions_errored = reports.iter().map(|r| r.errored_count()).sum::<usize>(),
            "Session bring-up complete"
        );

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChannelEvent, ChannelLink};
    use crate::faults::fault_channel;
    use crate::registry::spawn_registry;
    use crate::tenants::{StaticDirectory, TenantRecord};
    use async_trait::async_trait;
    use relay_core::{FaultOrigin, StartError};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Connector that accepts everything except endpoints named
    /// "unreachable", and keeps links alive without ever signalling.
    #[derive(Default)]
    struct StubConnector {
        held: Mutex<Vec<mpsc::Sender<ChannelEvent>>>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(
            &self,
            _tenant: TenantId,
            config: &ChannelConfig,
        ) -> Result<ChannelLink, StartError> {
            if config.endpoint == "unreachable" {
                return Err(StartError::ChannelUnreachable(
                    "connection refused".into(),
                ));
            }
            let (tx, rx) = mpsc::channel(8);
            if let Ok(mut held) = self.held.lock() {
                held.push(tx);
            }
            Ok(ChannelLink::new(rx))
        }
    }

    fn starter_with(records: Vec<TenantRecord>) -> (SessionStarter, RegistryHandle) {
        let registry = spawn_registry();
        let (faults, _faults_rx) = fault_channel();
        let starter = SessionStarter::new(
            registry.clone(),
            Arc::new(StaticDirectory::new(records)),
            Arc::new(StubConnector::default()),
            faults,
            SessionSettings {
                reconnect_delay: Duration::from_millis(10),
                retry_ceiling: 2,
            },
        );
        (starter, registry)
    }

    #[tokio::test]
    async fn test_partial_failure_within_tenant() {
        let records = vec![TenantRecord {
            tenant: TenantId::new(1),
            channels: vec![
                ChannelConfig::new(1, "gw-a:9300"),
                ChannelConfig::new(2, "unreachable"),
                ChannelConfig::new(3, ""),
            ],
        }];
        let (starter, _registry) = starter_with(records);

        let report = starter.start_all_for_tenant(TenantId::new(1)).await;

        assert_eq!(report.started_count(), 1);
        assert_eq!(report.errored_count(), 2);
        assert!(report.fetch_error.is_none());
    }

    #[tokio::test]
    async fn test_bulk_tolerance_across_tenants() {
        // 4 tenants, exactly 1 misconfigured: expect 3 started, 1 errored.
        let records = (1..=4u64)
            .map(|id| TenantRecord {
                tenant: TenantId::new(id),
                channels: vec![ChannelConfig::new(
                    1,
                    if id == 3 { "unreachable" } else { "gw:9300" },
                )],
            })
            .collect();
        let (starter, _registry) = starter_with(records);

        let reports = starter.start_all_active_tenants().await;

        assert_eq!(reports.len(), 4);
        let started: usize = reports.iter().map(|r| r.started_count()).sum();
        let errored: usize = reports.iter().map(|r| r.errored_count()).sum();
        assert_eq!(started, 3);
        assert_eq!(errored, 1);
    }

    #[tokio::test]
    async fn test_restart_is_idempotent_for_live_sessions() {
        let records = vec![TenantRecord {
            tenant: TenantId::new(1),
            channels: vec![ChannelConfig::new(1, "gw:9300")],
        }];
        let (starter, registry) = starter_with(records);

        let first = starter.start_all_for_tenant(TenantId::new(1)).await;
        assert_eq!(first.started_count(), 1);

        // Second pass sees the live occupant and leaves it alone.
        let second = starter.start_all_for_tenant(TenantId::new(1)).await;
        assert_eq!(second.started_count(), 1);
        assert_eq!(second.errored_count(), 0);
        assert_eq!(registry.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_directory_fetch_failure_emits_session_fault() {
        struct BrokenDirectory;

        #[async_trait]
        impl TenantDirectory for BrokenDirectory {
            async fn fetch_active_tenants(
                &self,
            ) -> Result<Vec<relay_core::Tenant>, crate::tenants::DirectoryError> {
                Err(crate::tenants::DirectoryError::Unavailable(
                    "database down".into(),
                ))
            }

            async fn channels_for(
                &self,
                _tenant: TenantId,
            ) -> Result<Vec<ChannelConfig>, crate::tenants::DirectoryError> {
                Ok(Vec::new())
            }
        }

        let registry = spawn_registry();
        let (faults, mut faults_rx) = fault_channel();
        let starter = SessionStarter::new(
            registry,
            Arc::new(BrokenDirectory),
            Arc::new(StubConnector::default()),
            faults,
            SessionSettings::default(),
        );

        let reports = starter.start_all_active_tenants().await;
        assert!(reports.is_empty());

        let fault = faults_rx.recv().await.expect("fault");
        assert_eq!(fault.origin, FaultOrigin::SessionFault);
    }
}
