//! Per-tenant session handle and its driver task.
//!
//! A `SessionHandle` wraps one tenant/channel connection. The handle
//! itself is thin; a spawned driver task owns the state machine:
//!
//! ```text
//! Starting ──► Connected ──► Reconnecting ──► Connected  (loop)
//!                                 │
//!                                 └──► Failed   (ceiling exhausted, fault emitted)
//! any state ──► Stopped          (cancellation token)
//! ```
//!
//! Reconnects use a fixed delay, not exponential backoff - preserved
//! original behavior. The retry counter is cumulative for the life of the
//! handle; once it passes the ceiling the driver marks the entry `Failed`,
//! emits a session fault for the recovery controller, and exits rather
//! than retrying forever.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{ChannelConfig, Fault, SessionKey, SessionStatus, StartError};

use crate::connector::{ChannelEvent, ChannelLink, Connector};
use crate::faults::FaultSender;
use crate::registry::{RegistryError, RegistryHandle};

/// Reconnect policy knobs for one session driver.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,

    /// Maximum cumulative disconnects before the session fails.
    pub retry_ceiling: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            retry_ceiling: 5,
        }
    }
}

/// Errors that can occur while bringing up one session.
#[derive(Debug, Clone, Error)]
pub enum SessionStartError {
    /// Config or connectivity failure.
    #[error(transparent)]
    Start(#[from] StartError),

    /// The registry rejected the key (occupied or full).
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Thin client for one running session.
///
/// The driver task owns the connection; the handle only carries the key
/// and the stop token.
pub struct SessionHandle {
    key: SessionKey,
    stop: CancellationToken,
    registry: RegistryHandle,
}

impl SessionHandle {
    /// Brings up a session: validates config, reserves the registry key,
    /// performs the initial connect, and spawns the driver.
    ///
    /// Returns with the entry in `Starting`; the driver transitions to
    /// `Connected` when the channel signals readiness.
    ///
    /// # Errors
    ///
    /// - `StartError::InvalidConfig` before any I/O
    /// - `RegistryError::AlreadyRegistered` from the reserve
    /// - `StartError::ChannelUnreachable` when the initial connect fails
    ///   (the reserved key is released again)
    pub async fn start(
        key: SessionKey,
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        registry: RegistryHandle,
        faults: FaultSender,
        settings: SessionSettings,
    ) -> Result<SessionHandle, SessionStartError> {
        config.validate().map_err(SessionStartError::Start)?;

        let stop = CancellationToken::new();
        registry.register(key, stop.clone()).await?;

        let link = match connector.connect(key.tenant, &config).await {
            Ok(link) => link,
            Err(e) => {
                registry.unregister(key).await;
                return Err(e.into());
            }
        };

        let driver = SessionDriver {
            key,
            config,
            connector,
            registry: registry.clone(),
            faults,
            settings,
            stop: stop.clone(),
            retry_count: 0,
        };
        tokio::spawn(driver.run(link));

        info!(session = %key, "Session starting");

        Ok(SessionHandle {
            key,
            stop,
            registry,
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Idempotent teardown; always ends in `Stopped` and releases the
    /// registry entry, regardless of current state. Never raises.
    pub async fn stop(&self) {
        if !self.registry.stop(self.key).await {
            // Registry gone or entry already released; make sure the
            // driver still observes the stop.
            self.stop.cancel();
        }
    }
}

/// Driver task: sole owner of the session state machine.
struct SessionDriver {
    key: SessionKey,
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    registry: RegistryHandle,
    faults: FaultSender,
    settings: SessionSettings,
    stop: CancellationToken,
    retry_count: u32,
}

impl SessionDriver {
    async fn run(mut self, mut link: ChannelLink) {
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    self.finish_stopped().await;
                    return;
                }

                event = link.next_event() => {
                    let reason = match event {
                        Some(ChannelEvent::Ready) => {
                            info!(session = %self.key, "Session connected");
                            self.registry
                                .update_status(self.key, SessionStatus::Connected, None, None)
                                .await;
                            continue;
                        }
                        Some(ChannelEvent::Disconnected { reason }) => reason,
                        None => "channel event stream closed".to_string(),
                    };

                    if !self.on_connection_lost(reason).await {
                        return;
                    }

                    match self.reconnect().await {
                        Some(new_link) => link = new_link,
                        None => return,
                    }
                }
            }
        }
    }

    /// Records one lost connection against the retry budget.
    ///
    /// Returns false when the ceiling is exhausted: the entry is marked
    /// `Failed`, a session fault is emitted, and the driver must exit.
    async fn on_connection_lost(&mut self, reason: String) -> bool {
        self.retry_count += 1;

        if self.retry_count > self.settings.retry_ceiling {
            warn!(
                session = %self.key,
                retry_count = self.retry_count,
                ceiling = self.settings.retry_ceiling,
                reason = %reason,
                "Reconnect ceiling exhausted, session failed"
            );

            self.registry
                .update_status(
                    self.key,
                    SessionStatus::Failed,
                    Some(self.retry_count),
                    Some(reason.clone()),
                )
                .await;

            self.faults
                .report(Fault::session(
                    format!("session {} exceeded its reconnect ceiling", self.key),
                    format!(
                        "retry_count={} ceiling={} last_reason={}",
                        self.retry_count, self.settings.retry_ceiling, reason
                    ),
                ))
                .await;

            return false;
        }

        debug!(
            session = %self.key,
            retry_count = self.retry_count,
            reason = %reason,
            "Session disconnected, reconnect scheduled"
        );

        self.registry
            .update_status(
                self.key,
                SessionStatus::Reconnecting,
                Some(self.retry_count),
                Some(reason),
            )
            .await;

        true
    }

    /// Fixed-delay reconnect loop; every failed attempt counts against
    /// the same retry budget as a disconnect.
    async fn reconnect(&mut self) -> Option<ChannelLink> {
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    self.finish_stopped().await;
                    return None;
                }

                _ = sleep(self.settings.reconnect_delay) => {}
            }

            match self.connector.connect(self.key.tenant, &self.config).await {
                Ok(link) => {
                    debug!(session = %self.key, "Reconnect attempt accepted");
                    return Some(link);
                }
                Err(e) => {
                    if !self.on_connection_lost(e.to_string()).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Terminal stop path: mark `Stopped` and release the entry.
    ///
    /// Both calls are no-ops when the registry already removed the entry
    /// (explicit `stop` through the actor), so the path is idempotent.
    async fn finish_stopped(&self) {
        self.registry
            .update_status(self.key, SessionStatus::Stopped, None, None)
            .await;
        self.registry.unregister(self.key).await;
        info!(session = %self.key, "Session stopped");
    }
}
