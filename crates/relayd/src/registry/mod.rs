//! Session registry using the Actor pattern.
//!
//! The registry is the single shared mutable structure within a worker
//! process: a mapping from `(tenant, channel)` key to the live session
//! entry, enforcing at-most-one non-`Stopped` session per key. It
//! receives commands via a tokio mpsc channel; because the actor applies
//! each command as one atomic step, no mutation spans a suspension point
//! and no lock is required.
//!
//! ```text
//! ┌──────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Session drivers  │────▶│  RegistryActor  │────▶│ Broadcast channel │
//! │ Starter/Recovery │     │ (state owner)   │     │ (SessionEvent)    │
//! └──────────────────┘     └─────────────────┘     └──────────────────┘
//!        RegistryCommand (mpsc)                      diagnostics subscribers
//! ```

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{RegistryCommand, RegistryError, RemovalReason, SessionEvent};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 128;

/// Spawn the registry actor and return a handle for interaction.
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
