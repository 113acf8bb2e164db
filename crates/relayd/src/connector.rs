//! External-channel collaborator boundary.
//!
//! The supervision core never speaks the messaging-network protocol
//! itself; it only needs to open a connection for a tenant/channel pair
//! and observe its liveness. `Connector` is that seam. The bundled
//! `TcpConnector` is the minimal concrete implementation: it treats TCP
//! establishment as the connection and stream closure as disconnect,
//! leaving protocol traffic to the channel client library.

use async_trait::async_trait;
use relay_core::{ChannelConfig, StartError, TenantId};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffer for per-link liveness events; only a handful are ever in flight.
const EVENT_BUFFER: usize = 8;

/// Liveness events observed on one channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel signalled readiness; the session is connected.
    Ready,

    /// The connection was lost.
    Disconnected { reason: String },
}

/// One live connection to an external channel, as seen by a session driver.
pub struct ChannelLink {
    events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelLink {
    pub fn new(events: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { events }
    }

    /// Next liveness event; `None` when the producing side went away,
    /// which drivers treat as a disconnect.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

/// Opens connections to external-channel endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Attempts one connection for the given tenant and channel config.
    ///
    /// # Errors
    ///
    /// - `StartError::InvalidConfig` for unusable configuration
    /// - `StartError::ChannelUnreachable` when the endpoint cannot be reached
    async fn connect(
        &self,
        tenant: TenantId,
        config: &ChannelConfig,
    ) -> Result<ChannelLink, StartError>;
}

/// TCP-based connector: connection established = ready, stream closed or
/// errored = disconnected.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        tenant: TenantId,
        config: &ChannelConfig,
    ) -> Result<ChannelLink, StartError> {
        config.validate()?;

        let mut stream = TcpStream::connect(&config.endpoint)
            .await
            .map_err(|e| StartError::ChannelUnreachable(e.to_string()))?;

        debug!(
            tenant = %tenant,
            channel = %config.id,
            endpoint = %config.endpoint,
            "Channel connection established"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            if tx.send(ChannelEvent::Ready).await.is_err() {
                return;
            }

            // Drain the stream purely for liveness; payload handling
            // belongs to the channel client library.
            let mut buf = [0u8; 4096];
            let reason = loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break "connection closed by remote".to_string(),
                    Ok(_) => continue,
                    Err(e) => break e.to_string(),
                }
            };

            let _ = tx.send(ChannelEvent::Disconnected { reason }).await;
        });

        Ok(ChannelLink::new(rx))
    }
}
