//! Tenant directory collaborator boundary.
//!
//! The persistence layer owns tenants; the supervision core only reads
//! the active set and each tenant's channel configs, at startup and
//! during session-fault recovery. `StaticDirectory` is the bundled
//! implementation, fed from a JSON bootstrap file or built in memory
//! for tests.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::{ChannelConfig, Tenant, TenantId};

/// Errors from the tenant directory collaborator.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// The backing store could not be read.
    #[error("tenant directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of active tenants and their channel configuration.
#[async_trait]
pub trait TenantDirectory: Send + Sync + 'static {
    /// All tenants with `active = true`.
    async fn fetch_active_tenants(&self) -> Result<Vec<Tenant>, DirectoryError>;

    /// Channel configs for one tenant; empty when the tenant has none.
    async fn channels_for(&self, tenant: TenantId) -> Result<Vec<ChannelConfig>, DirectoryError>;
}

/// One bootstrap-file entry: a tenant and its channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant: TenantId,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// In-memory tenant directory.
///
/// Tenants are kept ordered by id so bring-up and recovery passes walk
/// them deterministically.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    tenants: BTreeMap<TenantId, Vec<ChannelConfig>>,
}

impl StaticDirectory {
    pub fn new(records: Vec<TenantRecord>) -> Self {
        let tenants = records
            .into_iter()
            .map(|r| (r.tenant, r.channels))
            .collect();
        Self { tenants }
    }

    /// Loads the directory from a JSON bootstrap file
    /// (an array of `{ "tenant": <id>, "channels": [...] }` records).
    ///
    /// # Errors
    ///
    /// `DirectoryError::Unavailable` when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Unavailable(format!("{}: {e}", path.display())))?;
        let records: Vec<TenantRecord> = serde_json::from_str(&raw)
            .map_err(|e| DirectoryError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self::new(records))
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn fetch_active_tenants(&self) -> Result<Vec<Tenant>, DirectoryError> {
        Ok(self.tenants.keys().map(|id| Tenant { id: *id }).collect())
    }

    async fn channels_for(&self, tenant: TenantId) -> Result<Vec<ChannelConfig>, DirectoryError> {
        Ok(self.tenants.get(&tenant).cloned().unwrap_or_default())
    }
}
