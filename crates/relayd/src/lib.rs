//! Relay daemon library.
//!
//! Supervision core of the messaging-gateway backend: keeps one session
//! per tenant/channel pair alive against an external messaging network,
//! records every fault durably, and recovers by reconnecting sessions or
//! escalating to a process restart.
//!
//! # Architecture
//!
//! ```text
//! sessions ─┐
//! monitor  ─┼──► fault channel ──► recovery dispatcher ──► crash log
//! starter  ─┘                        │            │
//!                                    ▼            ▼
//!                            reconnect pass   process restart
//! ```
//!
//! The registry actor serializes all session bookkeeping; everything else
//! talks to it through a cloneable handle.

pub mod config;
pub mod connector;
pub mod daemon;
pub mod faults;
pub mod heartbeat;
pub mod monitor;
pub mod outbound;
pub mod pool;
pub mod recorder;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod starter;
pub mod tenants;
