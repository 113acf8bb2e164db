//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of session state within a worker
//! process. It receives commands via an mpsc channel and publishes events
//! via broadcast. Because every mutation happens inside this one task, no
//! mutation ever spans a suspension point and the at-most-one-session-per-
//! key invariant needs no lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relay_core::{SessionKey, SessionSnapshot, SessionStatus};

use super::commands::{RegistryCommand, RegistryError, RemovalReason, SessionEvent};

/// One registry entry: the live state of a session handle.
struct SessionEntry {
    status: SessionStatus,
    retry_count: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    /// Cancellation token shared with the session driver; cancelled on
    /// explicit teardown so the driver observes the stop.
    stop: CancellationToken,
}

impl SessionEntry {
    fn snapshot(&self, key: SessionKey) -> SessionSnapshot {
        SessionSnapshot {
            key,
            status: self.status,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
        }
    }
}

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    sessions: HashMap<SessionKey, SessionEntry>,
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    pub async fn run(mut self) {
        info!("Session registry starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "Session registry stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                key,
                stop,
                respond_to,
            } => {
                let result = self.handle_register(key, stop);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdateStatus {
                key,
                status,
                retry_count,
                last_error,
            } => {
                self.handle_update_status(key, status, retry_count, last_error);
            }
            RegistryCommand::Unregister { key } => {
                self.handle_unregister(key);
            }
            RegistryCommand::Stop { key, respond_to } => {
                let existed = self.handle_stop(key);
                let _ = respond_to.send(existed);
            }
            RegistryCommand::Get { key, respond_to } => {
                let snapshot = self.sessions.get(&key).map(|e| e.snapshot(key));
                let _ = respond_to.send(snapshot);
            }
            RegistryCommand::ListActive { respond_to } => {
                let snapshots = self
                    .sessions
                    .iter()
                    .map(|(key, entry)| entry.snapshot(*key))
                    .collect();
                let _ = respond_to.send(snapshots);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Reserves a key for a new session handle.
    ///
    /// Enforcement point of the at-most-one invariant: a non-`Stopped`
    /// occupant rejects the registration; a `Stopped` leftover is replaced.
    fn handle_register(
        &mut self,
        key: SessionKey,
        stop: CancellationToken,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.sessions.get(&key) {
            if !existing.status.is_stopped() {
                debug!(
                    session = %key,
                    status = %existing.status,
                    "Key occupied by a live session, rejecting registration"
                );
                return Err(RegistryError::AlreadyRegistered(key));
            }

            self.sessions.remove(&key);
            let _ = self.event_publisher.send(SessionEvent::Removed {
                key,
                reason: RemovalReason::Replaced,
            });
        }

        self.sessions.insert(
            key,
            SessionEntry {
                status: SessionStatus::Starting,
                retry_count: 0,
                last_error: None,
                created_at: Utc::now(),
                stop,
            },
        );

        info!(
            session = %key,
            total_sessions = self.sessions.len(),
            "Session registered"
        );

        let _ = self.event_publisher.send(SessionEvent::Registered { key });

        Ok(())
    }

    /// Applies a status transition reported by a session driver.
    ///
    /// Unknown keys are ignored: the entry may have been explicitly
    /// stopped while the driver's update was in flight.
    fn handle_update_status(
        &mut self,
        key: SessionKey,
        status: SessionStatus,
        retry_count: Option<u32>,
        last_error: Option<String>,
    ) {
        let Some(entry) = self.sessions.get_mut(&key) else {
            debug!(session = %key, status = %status, "Status update for unknown key, ignoring");
            return;
        };

        entry.status = status;
        if let Some(count) = retry_count {
            entry.retry_count = count;
        }
        if last_error.is_some() {
            entry.last_error = last_error;
        }

        debug!(
            session = %key,
            status = %status,
            retry_count = entry.retry_count,
            "Session status changed"
        );

        let _ = self.event_publisher.send(SessionEvent::StatusChanged {
            key,
            status,
            retry_count: entry.retry_count,
        });
    }

    /// Removes an entry; no-op when absent.
    fn handle_unregister(&mut self, key: SessionKey) {
        if self.sessions.remove(&key).is_none() {
            return;
        }

        debug!(
            session = %key,
            remaining_sessions = self.sessions.len(),
            "Session unregistered"
        );

        let _ = self.event_publisher.send(SessionEvent::Removed {
            key,
            reason: RemovalReason::Detached,
        });
    }

    /// Explicit idempotent teardown: cancels the driver and releases the key.
    ///
    /// Returns whether an entry existed. Safe to call any number of times,
    /// in any session state - this is the only path out of `Failed`.
    fn handle_stop(&mut self, key: SessionKey) -> bool {
        let Some(entry) = self.sessions.remove(&key) else {
            debug!(session = %key, "Stop for absent key is a no-op");
            return false;
        };

        entry.stop.cancel();

        info!(
            session = %key,
            status = %entry.status,
            remaining_sessions = self.sessions.len(),
            "Session stopped"
        );

        let _ = self.event_publisher.send(SessionEvent::Removed {
            key,
            reason: RemovalReason::Explicit,
        });

        true
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of sessions currently registered.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
