//! Relay Core - Shared types for the messaging-gateway supervision daemon
//!
//! This crate provides the domain types shared between the daemon (relayd)
//! and operator tooling: tenant and channel identifiers, the session status
//! state machine, the fault taxonomy, and the durable crash-record format.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod error;
pub mod fault;
pub mod session;
pub mod tenant;

// Re-exports for convenience
pub use channel::{ChannelConfig, ChannelId};
pub use error::StartError;
pub use fault::{CrashRecord, Fault, FaultOrigin};
pub use session::{SessionKey, SessionSnapshot, SessionStatus};
pub use tenant::{Tenant, TenantId};
