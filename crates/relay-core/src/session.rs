//! Session identity, status state machine data, and registry snapshots.

use crate::{ChannelId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry key for one tenant/channel session.
///
/// The registry invariant holds per key: at most one non-`Stopped`
/// session handle exists process-wide for any given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant: TenantId,
    pub channel: ChannelId,
}

impl SessionKey {
    pub fn new(tenant: impl Into<TenantId>, channel: impl Into<ChannelId>) -> Self {
        Self {
            tenant: tenant.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.channel)
    }
}

/// Lifecycle status of a session handle.
///
/// ```text
/// Starting ──► Connected ──► Reconnecting ──► Connected  (loop)
///                                 │
///                                 └──► Failed   (retry ceiling exhausted)
///
/// any state ──► Stopped          (explicit teardown)
/// ```
///
/// `Failed` and `Stopped` are terminal for the session driver; only
/// `Stopped` releases the registry entry, and `Failed` is reachable
/// to `Stopped` solely via explicit cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Initial connection attempt accepted, waiting for channel readiness.
    Starting,

    /// The underlying channel signalled readiness.
    Connected,

    /// Lost the channel; a fixed-delay reconnect attempt is scheduled.
    Reconnecting,

    /// Retry ceiling exhausted; waiting for explicit cleanup or recovery.
    Failed,

    /// Explicitly torn down; the registry entry is released.
    Stopped,
}

impl SessionStatus {
    /// True for states the driver never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// True only for `Stopped` - the single state that releases a
    /// registry key for re-registration.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Point-in-time view of one registry entry.
///
/// Snapshots are copies taken inside the registry actor; they never
/// observe a partially-applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub status: SessionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = SessionKey::new(3, 14);
        assert_eq!(key.to_string(), "3/14");
    }

    #[test]
    fn test_status_terminality() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Connected.is_terminal());
        assert!(!SessionStatus::Reconnecting.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());

        // Failed is terminal but does not release the registry key.
        assert!(!SessionStatus::Failed.is_stopped());
        assert!(SessionStatus::Stopped.is_stopped());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(SessionStatus::Stopped.to_string(), "stopped");
    }
}
