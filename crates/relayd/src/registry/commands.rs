//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the
//! `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the
//! panic-free policy.

use relay_core::{SessionKey, SessionSnapshot, SessionStatus};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Request-response commands carry a oneshot channel; status updates are
/// fire-and-forget and rely on the mpsc channel for ordering.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Reserve a session key for a new handle.
    ///
    /// This is the enforcement point of the at-most-one invariant: the
    /// command fails if a non-`Stopped` entry already occupies the key.
    /// A lingering `Stopped` entry is replaced.
    ///
    /// # Errors
    /// - `RegistryError::AlreadyRegistered` if a live entry occupies the key
    Register {
        key: SessionKey,
        /// Cancellation token owned by the session driver; kept in the
        /// entry so explicit teardown can reach the driver.
        stop: CancellationToken,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Record a status transition for an existing entry.
    ///
    /// Fire-and-forget: a session driver is the only writer for its key
    /// and the channel preserves its ordering. Unknown keys are ignored
    /// (the entry may have been explicitly stopped underneath the driver).
    UpdateStatus {
        key: SessionKey,
        status: SessionStatus,
        retry_count: Option<u32>,
        last_error: Option<String>,
    },

    /// Remove an entry; no-op when absent.
    Unregister { key: SessionKey },

    /// Explicit idempotent teardown of one session.
    ///
    /// Cancels the entry's stop token and releases the key. Responds with
    /// `true` when an entry existed. This is the only path out of `Failed`.
    Stop {
        key: SessionKey,
        respond_to: oneshot::Sender<bool>,
    },

    /// Get a snapshot of a single entry.
    Get {
        key: SessionKey,
        respond_to: oneshot::Sender<Option<SessionSnapshot>>,
    },

    /// Snapshot every entry (not live; used by health reporting).
    ListActive {
        respond_to: oneshot::Sender<Vec<SessionSnapshot>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A non-`Stopped` session already occupies this key.
    #[error("session already registered: {0}")]
    AlreadyRegistered(SessionKey),

    /// The command or response channel was closed before completion.
    ///
    /// This typically indicates the actor was shut down.
    #[error("registry channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to diagnostics subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A key was reserved for a new session handle.
    Registered { key: SessionKey },

    /// An entry transitioned status.
    StatusChanged {
        key: SessionKey,
        status: SessionStatus,
        retry_count: u32,
    },

    /// An entry was released.
    Removed {
        key: SessionKey,
        reason: RemovalReason,
    },
}

/// Reason why a session entry was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicit `stop` teardown.
    Explicit,

    /// The session driver released its own entry on shutdown.
    Detached,

    /// A lingering `Stopped` entry was replaced by a new registration.
    Replaced,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly stopped"),
            Self::Detached => write!(f, "released by session driver"),
            Self::Replaced => write!(f, "stopped entry replaced"),
        }
    }
}
