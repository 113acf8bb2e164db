//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending
//! commands to the registry actor and subscribing to session events.
//! Channel errors are mapped to `RegistryError::ChannelClosed`; the
//! fire-and-forget paths swallow them (the actor only closes on shutdown).

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use relay_core::{SessionKey, SessionSnapshot, SessionStatus};

use super::commands::{RegistryCommand, RegistryError, SessionEvent};

/// Handle for interacting with the registry actor.
///
/// Cheap to clone and shareable across tasks; all methods communicate
/// with the actor via channels.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Reserve a session key for a new handle.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if a live entry occupies the key
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        key: SessionKey,
        stop: CancellationToken,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Register {
                key,
                stop,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Record a status transition for an existing entry.
    ///
    /// Fire-and-forget; ordering is preserved by the command channel.
    pub async fn update_status(
        &self,
        key: SessionKey,
        status: SessionStatus,
        retry_count: Option<u32>,
        last_error: Option<String>,
    ) {
        let _ = self
            .sender
            .send(RegistryCommand::UpdateStatus {
                key,
                status,
                retry_count,
                last_error,
            })
            .await;
    }

    /// Remove an entry; no-op when absent.
    pub async fn unregister(&self, key: SessionKey) {
        let _ = self
            .sender
            .send(RegistryCommand::Unregister { key })
            .await;
    }

    /// Explicitly stop one session: cancel its driver and release the key.
    ///
    /// Idempotent and infallible from the caller's perspective; returns
    /// whether an entry existed (false when absent or the actor is gone).
    pub async fn stop(&self, key: SessionKey) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Stop {
                key,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Get a snapshot of a single entry.
    ///
    /// Returns `None` if the key is absent or the actor has shut down.
    pub async fn get(&self, key: SessionKey) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Get {
                key,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Snapshot every entry.
    ///
    /// Returns an empty vector if nothing is registered or the actor
    /// has shut down.
    pub async fn list_active(&self) -> Vec<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ListActive { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        let handle = RegistryHandle::new(cmd_tx, event_tx);
        (handle, cmd_rx)
    }

    #[tokio::test]
    async fn test_register_sends_command() {
        let (handle, mut rx) = create_test_handle();
        let key = SessionKey::new(1, 2);

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Register {
                key, respond_to, ..
            }) = rx.recv().await
            {
                assert_eq!(key, SessionKey::new(1, 2));
                let _ = respond_to.send(Ok(()));
                return true;
            }
            false
        });

        let result = handle.register(key, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_register_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .register(SessionKey::new(1, 2), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_stop_returns_false_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(!handle.stop(SessionKey::new(1, 2)).await);
    }

    #[tokio::test]
    async fn test_update_status_ignores_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        // Should not panic or error
        handle
            .update_status(SessionKey::new(1, 2), SessionStatus::Connected, None, None)
            .await;
    }

    #[tokio::test]
    async fn test_list_active_returns_empty_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_returns_none_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.get(SessionKey::new(1, 2)).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_returns_receiver() {
        let (handle, _rx) = create_test_handle();
        let _subscriber = handle.subscribe();
    }
}
