//! Tenant identity types.
//!
//! A tenant is an isolated customer scope owning its own set of channel
//! sessions. The persistence layer owns tenant lifecycle; the supervision
//! core only ever sees the identifiers of currently-active tenants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a tenant.
///
/// Assigned by the persistence layer; the supervision core never
/// interprets the value beyond equality and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(u64);

impl TenantId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TenantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A tenant as seen by the supervision core.
///
/// The directory collaborator returns only tenants with `active = true`,
/// so an inactive flag never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>) -> Self {
        Self { id: id.into() }
    }
}
