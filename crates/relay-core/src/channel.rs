//! Channel configuration types.
//!
//! A channel is one configured external-network endpoint a tenant session
//! connects to. A tenant may own several channels; each gets its own
//! session handle.

use crate::error::StartError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a configured channel within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Configuration for one external-channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: ChannelId,

    /// Network endpoint the session connects to (e.g. "host:port").
    pub endpoint: String,

    /// Optional operator-facing label.
    #[serde(default)]
    pub label: Option<String>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<ChannelId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            label: None,
        }
    }

    /// Validates the configuration before any connection attempt.
    ///
    /// # Errors
    ///
    /// `StartError::InvalidConfig` if the endpoint is empty or whitespace.
    pub fn validate(&self) -> Result<(), StartError> {
        if self.endpoint.trim().is_empty() {
            return Err(StartError::InvalidConfig(format!(
                "channel {} has an empty endpoint",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_endpoint() {
        let cfg = ChannelConfig::new(1, "gateway.example:9300");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let cfg = ChannelConfig::new(1, "   ");
        assert!(matches!(cfg.validate(), Err(StartError::InvalidConfig(_))));
    }
}
