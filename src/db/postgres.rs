use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;

use super::store::{
    AuditStore, CredentialStore, ErasureStore, PurgeOutcome, RetentionStore, StoreError,
    StoreResult, TenantRegistry,
};
use crate::models::{
    tenant_data, AuditAction, AuditLogEntry, Credential, DataType, DeletionResult, EntityKind,
    PolicyDraft, PolicyStatus, RetentionPolicy, SealedCredential, SealedTokens, TenantRecord,
};
use crate::tenant::{TenantContext, TenantId};

/// Postgres-backed store.
///
/// Each tenant-scoped call runs in its own transaction that first binds
/// `app.current_tenant`; the row-security policies in the migrations do the
/// rest, and raise instead of filtering when nothing is bound.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scoped(&self, ctx: &TenantContext) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
            .bind(ctx.tenant_id().to_string())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

#[async_trait]
impl TenantRegistry for PgStore {
    async fn register_tenant(&self, tenant: TenantId) -> StoreResult<()> {
        TenantRecord::register(&self.pool, tenant).await?;
        match TenantRecord::find(&self.pool, tenant).await? {
            Some(TenantRecord {
                erased_at: Some(erased_at),
                ..
            }) => Err(StoreError::TenantErased(format!(
                "tenant {} was erased at {}",
                tenant, erased_at
            ))),
            _ => Ok(()),
        }
    }

    async fn list_active_tenants(&self) -> StoreResult<Vec<TenantId>> {
        let tenants = TenantRecord::list_active(&self.pool).await?;
        Ok(tenants.into_iter().map(|t| t.id).collect())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn upsert_credential(
        &self,
        ctx: &TenantContext,
        sealed: SealedCredential,
    ) -> StoreResult<Credential> {
        let mut tx = self.scoped(ctx).await?;
        let credential = Credential::upsert(&mut tx, ctx.tenant_id(), sealed).await?;
        tx.commit().await?;
        Ok(credential)
    }

    async fn find_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> StoreResult<Option<Credential>> {
        let mut tx = self.scoped(ctx).await?;
        let credential = Credential::find_by_provider(&mut tx, ctx.tenant_id(), provider).await?;
        tx.commit().await?;
        Ok(credential)
    }

    async fn update_credential_tokens(
        &self,
        ctx: &TenantContext,
        provider: &str,
        tokens: SealedTokens,
    ) -> StoreResult<Credential> {
        let mut tx = self.scoped(ctx).await?;
        let credential = Credential::update_tokens(&mut tx, ctx.tenant_id(), provider, tokens)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("active {} credential", provider)))?;
        tx.commit().await?;
        Ok(credential)
    }

    async fn deactivate_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> StoreResult<bool> {
        let mut tx = self.scoped(ctx).await?;
        let changed = Credential::deactivate(&mut tx, ctx.tenant_id(), provider).await?;
        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn audit_tip(&self, ctx: &TenantContext) -> StoreResult<Option<AuditLogEntry>> {
        let mut tx = self.scoped(ctx).await?;
        let tip = AuditLogEntry::find_tip(&mut tx, ctx.tenant_id()).await?;
        tx.commit().await?;
        Ok(tip)
    }

    async fn append_audit_entry(
        &self,
        ctx: &TenantContext,
        entry: &AuditLogEntry,
    ) -> StoreResult<()> {
        let mut tx = self.scoped(ctx).await?;
        AuditLogEntry::insert(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit_chain(&self, ctx: &TenantContext) -> StoreResult<Vec<AuditLogEntry>> {
        let mut tx = self.scoped(ctx).await?;
        let entries = AuditLogEntry::list_chain(&mut tx, ctx.tenant_id()).await?;
        tx.commit().await?;
        Ok(entries)
    }

    async fn audit_entries_by_action(
        &self,
        ctx: &TenantContext,
        action: AuditAction,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let mut tx = self.scoped(ctx).await?;
        let entries =
            AuditLogEntry::list_by_action(&mut tx, ctx.tenant_id(), action, since).await?;
        tx.commit().await?;
        Ok(entries)
    }
}

#[async_trait]
impl RetentionStore for PgStore {
    async fn find_active_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>> {
        let mut tx = self.scoped(ctx).await?;
        let policy = RetentionPolicy::find_active(&mut tx, ctx.tenant_id(), data_type).await?;
        tx.commit().await?;
        Ok(policy)
    }

    async fn insert_policy(
        &self,
        ctx: &TenantContext,
        draft: PolicyDraft,
    ) -> StoreResult<RetentionPolicy> {
        let mut tx = self.scoped(ctx).await?;
        let policy = RetentionPolicy::insert(&mut tx, ctx.tenant_id(), draft, 1).await?;
        tx.commit().await?;
        Ok(policy)
    }

    async fn supersede_policy(
        &self,
        ctx: &TenantContext,
        draft: PolicyDraft,
    ) -> StoreResult<(RetentionPolicy, RetentionPolicy)> {
        let mut tx = self.scoped(ctx).await?;
        let retired = RetentionPolicy::retire(
            &mut tx,
            ctx.tenant_id(),
            draft.data_type,
            PolicyStatus::Superseded,
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("active {} policy", draft.data_type)))?;
        let created =
            RetentionPolicy::insert(&mut tx, ctx.tenant_id(), draft, retired.version + 1).await?;
        tx.commit().await?;
        Ok((retired, created))
    }

    async fn disable_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>> {
        let mut tx = self.scoped(ctx).await?;
        let retired =
            RetentionPolicy::retire(&mut tx, ctx.tenant_id(), data_type, PolicyStatus::Disabled)
                .await?;
        tx.commit().await?;
        Ok(retired)
    }

    async fn list_active_policies(&self, ctx: &TenantContext) -> StoreResult<Vec<RetentionPolicy>> {
        let mut tx = self.scoped(ctx).await?;
        let policies = RetentionPolicy::list_active(&mut tx, ctx.tenant_id()).await?;
        tx.commit().await?;
        Ok(policies)
    }

    async fn count_rows(&self, ctx: &TenantContext, data_type: DataType) -> StoreResult<u64> {
        let mut tx = self.scoped(ctx).await?;
        let count = tenant_data::count_rows(&mut tx, ctx.tenant_id(), data_type.entity()).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn count_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.scoped(ctx).await?;
        let count =
            tenant_data::count_rows_before(&mut tx, ctx.tenant_id(), data_type, cutoff).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn delete_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.scoped(ctx).await?;
        let deleted =
            tenant_data::delete_rows_before(&mut tx, ctx.tenant_id(), data_type, cutoff).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl ErasureStore for PgStore {
    async fn tenant_row_counts(
        &self,
        ctx: &TenantContext,
    ) -> StoreResult<BTreeMap<EntityKind, u64>> {
        let mut tx = self.scoped(ctx).await?;
        let counts = tenant_data::residue(&mut tx, ctx.tenant_id()).await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn purge_tenant(
        &self,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> StoreResult<PurgeOutcome> {
        let tenant_id = ctx.tenant_id();
        let mut tx = self.scoped(ctx).await?;

        let mut per_entity_counts = BTreeMap::new();
        for kind in EntityKind::ERASURE_ORDER {
            if cancel.is_cancelled() {
                tx.rollback().await?;
                return Ok(PurgeOutcome::Cancelled);
            }
            let removed = tenant_data::delete_all(&mut tx, tenant_id, kind).await?;
            if removed > 0 {
                per_entity_counts.insert(kind, removed);
            }
        }

        // Verification pass inside the same transaction: anything still
        // visible (e.g. a row committed concurrently) aborts the erasure.
        let residue = tenant_data::residue(&mut tx, tenant_id).await?;
        if !residue.is_empty() {
            tx.rollback().await?;
            return Ok(PurgeOutcome::Residue(residue));
        }

        let result = DeletionResult {
            tenant_id,
            per_entity_counts,
            verified: true,
            timestamp: super::now(),
        };
        DeletionResult::insert(&mut tx, &result).await?;
        TenantRecord::mark_erased(&mut tx, tenant_id).await?;
        tx.commit().await?;

        Ok(PurgeOutcome::Purged(result))
    }

    async fn find_deletion_result(
        &self,
        ctx: &TenantContext,
    ) -> StoreResult<Option<DeletionResult>> {
        let mut tx = self.scoped(ctx).await?;
        let result = DeletionResult::find(&mut tx, ctx.tenant_id()).await?;
        tx.commit().await?;
        Ok(result)
    }
}
