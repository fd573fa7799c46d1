//! Tenant identity and the bound context every storage call runs under.
//!
//! A [`TenantContext`] can only be created from an authenticated source
//! (the session middleware) or as a named system actor for background jobs.
//! It is passed explicitly to every service and storage call; there is no
//! ambient "current tenant".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GovernanceError;

/// Opaque identifier of a vendor account.
///
/// The nil UUID is rejected so no tenant-scoped row can carry an empty owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(try_from = "Uuid", into = "Uuid")]
#[sqlx(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Result<Self, GovernanceError> {
        if id.is_nil() {
            return Err(GovernanceError::isolation("tenant identifier is empty"));
        }
        Ok(Self(id))
    }

    /// Generates a fresh tenant id (used when provisioning and in tests).
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl TryFrom<Uuid> for TenantId {
    type Error = GovernanceError;

    fn try_from(value: Uuid) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for Uuid {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl FromStr for TenantId {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s)
            .map_err(|e| GovernanceError::Validation(format!("invalid tenant id: {}", e)))?;
        Self::new(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Actor name recorded for retention work started by the scheduler.
pub const SYSTEM_RETENTION_ACTOR: &str = "system:retention";

/// The tenant binding for one logical operation (request, job or transaction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
    actor: String,
}

impl TenantContext {
    /// Binds an authenticated tenant and the principal acting on its behalf.
    pub fn bind(tenant_id: TenantId, actor: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor: actor.into(),
        }
    }

    /// Binds a tenant for background work performed by a named system actor.
    pub fn system(tenant_id: TenantId, actor: &str) -> Self {
        debug_assert!(actor.starts_with("system:"));
        Self::bind(tenant_id, actor)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Fails when a row owned by another tenant reaches this context.
    pub fn authorize(&self, owner: TenantId) -> Result<(), GovernanceError> {
        if owner != self.tenant_id {
            return Err(GovernanceError::isolation(format!(
                "context bound to {} touched a row owned by {}",
                self.tenant_id, owner
            )));
        }
        Ok(())
    }

    /// Rejects a tenant id supplied in a request payload unless it matches
    /// the binding. The binding always wins; a mismatch is a violation.
    pub fn reject_foreign(&self, supplied: Option<TenantId>) -> Result<(), GovernanceError> {
        match supplied {
            Some(other) if other != self.tenant_id => Err(GovernanceError::isolation(format!(
                "payload tenant {} does not match bound tenant {}",
                other, self.tenant_id
            ))),
            _ => Ok(()),
        }
    }
}
