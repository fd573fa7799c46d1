//! Storage boundary of the governance core.
//!
//! Every tenant-scoped operation takes the bound [`TenantContext`]; there is
//! no method that reads or writes vendor data without one. The audit log,
//! deletion results and tenant registry are the only control-plane data.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{
    AuditAction, AuditLogEntry, Credential, DataType, DeletionResult, EntityKind, PolicyDraft,
    RetentionPolicy, SealedCredential, SealedTokens,
};
use crate::tenant::{TenantContext, TenantId};

/// SQLSTATE raised by `app_current_tenant()` when no tenant is bound.
pub const SQLSTATE_NO_TENANT: &str = "TI001";
const SQLSTATE_RLS_CHECK: &str = "42501";
const SQLSTATE_UNIQUE: &str = "23505";
/// SQLSTATE raised by the insert triggers once a tenant has been erased.
pub const SQLSTATE_TENANT_ERASED: &str = "TE001";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("tenant isolation violation: {0}")]
    Isolation(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("tenant erased: {0}")]
    TenantErased(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let code = e
            .as_database_error()
            .and_then(|db| db.code().map(|code| code.into_owned()));
        match code.as_deref() {
            Some(SQLSTATE_NO_TENANT) | Some(SQLSTATE_RLS_CHECK) => {
                StoreError::Isolation(e.to_string())
            }
            Some(SQLSTATE_UNIQUE) => StoreError::Conflict(e.to_string()),
            Some(SQLSTATE_TENANT_ERASED) => StoreError::TenantErased(e.to_string()),
            _ => StoreError::Database(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the transactional tenant purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Everything was removed, verified and the result persisted.
    Purged(DeletionResult),
    /// Rows survived; the transaction was rolled back.
    Residue(BTreeMap<EntityKind, u64>),
    /// Cancelled between entity kinds; the transaction was rolled back.
    Cancelled,
}

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Registers the tenant if unknown; `TenantErased` once it was erased.
    async fn register_tenant(&self, tenant: TenantId) -> StoreResult<()>;

    async fn list_active_tenants(&self) -> StoreResult<Vec<TenantId>>;
}

/// Inserts for an erased tenant fail with `StoreError::TenantErased`. The
/// audit log is the exception: it still accepts `TENANT_ERASED` entries.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn upsert_credential(
        &self,
        ctx: &TenantContext,
        sealed: SealedCredential,
    ) -> StoreResult<Credential>;

    /// The credential for a provider whether active or revoked.
    async fn find_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> StoreResult<Option<Credential>>;

    async fn update_credential_tokens(
        &self,
        ctx: &TenantContext,
        provider: &str,
        tokens: SealedTokens,
    ) -> StoreResult<Credential>;

    async fn deactivate_credential(&self, ctx: &TenantContext, provider: &str)
        -> StoreResult<bool>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn audit_tip(&self, ctx: &TenantContext) -> StoreResult<Option<AuditLogEntry>>;

    /// Appends a chained entry; `Conflict` if the sequence number is taken.
    async fn append_audit_entry(&self, ctx: &TenantContext, entry: &AuditLogEntry)
        -> StoreResult<()>;

    async fn audit_chain(&self, ctx: &TenantContext) -> StoreResult<Vec<AuditLogEntry>>;

    async fn audit_entries_by_action(
        &self,
        ctx: &TenantContext,
        action: AuditAction,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<AuditLogEntry>>;
}

#[async_trait]
pub trait RetentionStore: Send + Sync {
    async fn find_active_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>>;

    /// Inserts version 1; `Conflict` if an active policy exists.
    async fn insert_policy(&self, ctx: &TenantContext, draft: PolicyDraft)
        -> StoreResult<RetentionPolicy>;

    /// Atomically retires the active version and inserts the next one.
    /// Returns (retired, created).
    async fn supersede_policy(
        &self,
        ctx: &TenantContext,
        draft: PolicyDraft,
    ) -> StoreResult<(RetentionPolicy, RetentionPolicy)>;

    async fn disable_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>>;

    async fn list_active_policies(&self, ctx: &TenantContext) -> StoreResult<Vec<RetentionPolicy>>;

    async fn count_rows(&self, ctx: &TenantContext, data_type: DataType) -> StoreResult<u64>;

    async fn count_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Deletes the expired rows (and their cascade) in one transaction.
    async fn delete_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait ErasureStore: Send + Sync {
    /// Rows held by the tenant in each tenant-scoped table (non-zero only).
    async fn tenant_row_counts(&self, ctx: &TenantContext)
        -> StoreResult<BTreeMap<EntityKind, u64>>;

    /// Deletes every tenant-scoped row in erasure order, verifies nothing is
    /// left, persists the result and marks the tenant erased, all in one
    /// transaction. Residue or cancellation rolls everything back.
    async fn purge_tenant(
        &self,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> StoreResult<PurgeOutcome>;

    /// The latest recorded erasure of the tenant.
    async fn find_deletion_result(&self, ctx: &TenantContext)
        -> StoreResult<Option<DeletionResult>>;
}

/// Everything the services need from one backing store.
pub trait GovernanceStore:
    TenantRegistry + CredentialStore + AuditStore + RetentionStore + ErasureStore
{
}

impl<T> GovernanceStore for T where
    T: TenantRegistry + CredentialStore + AuditStore + RetentionStore + ErasureStore
{
}
