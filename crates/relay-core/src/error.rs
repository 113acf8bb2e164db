//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur while starting one session.
///
/// Both variants are per-session: they appear in start reports and are
/// never fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// The channel configuration cannot be used for a connection attempt.
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),

    /// The external channel endpoint could not be reached.
    #[error("channel unreachable: {0}")]
    ChannelUnreachable(String),
}
