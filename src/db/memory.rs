//! In-process store with the same isolation rules as the Postgres schema.
//!
//! Used by the test-suite and for running the service without a database.
//! All state sits behind one mutex, so each trait call is atomic the way a
//! single Postgres transaction is.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::store::{
    AuditStore, CredentialStore, ErasureStore, PurgeOutcome, RetentionStore, StoreError,
    StoreResult, TenantRegistry,
};
use crate::models::{
    AuditAction, AuditLogEntry, Credential, DataType, DeletionResult, EntityKind, PolicyDraft,
    PolicyStatus, RetentionPolicy, SealedCredential, SealedTokens,
};
use crate::tenant::{TenantContext, TenantId};

#[derive(Debug, Clone)]
struct DataRow {
    id: Uuid,
    tenant_id: TenantId,
    data_type: DataType,
    product_id: Option<Uuid>,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeMap<TenantId, Option<DateTime<Utc>>>,
    credentials: Vec<Credential>,
    audit: Vec<AuditLogEntry>,
    policies: Vec<RetentionPolicy>,
    rows: Vec<DataRow>,
    deletion_results: BTreeMap<TenantId, DeletionResult>,
    #[cfg(test)]
    undeletable: HashSet<DataType>,
}

impl MemoryState {
    /// Mirrors the insert triggers that refuse rows for an erased tenant.
    fn ensure_live(&self, tenant_id: TenantId) -> StoreResult<()> {
        match self.tenants.get(&tenant_id) {
            Some(Some(erased_at)) => Err(StoreError::TenantErased(format!(
                "tenant {} was erased at {}",
                tenant_id, erased_at
            ))),
            _ => Ok(()),
        }
    }

    fn count(&self, tenant_id: TenantId, kind: EntityKind) -> u64 {
        let count = match kind {
            EntityKind::Credentials => self
                .credentials
                .iter()
                .filter(|c| c.tenant_id == tenant_id)
                .count(),
            EntityKind::RetentionPolicies => self
                .policies
                .iter()
                .filter(|p| p.tenant_id == tenant_id)
                .count(),
            data_kind => self
                .rows
                .iter()
                .filter(|r| r.tenant_id == tenant_id && r.data_type.entity() == data_kind)
                .count(),
        };
        count as u64
    }

    fn residue(&self, tenant_id: TenantId) -> BTreeMap<EntityKind, u64> {
        EntityKind::ERASURE_ORDER
            .into_iter()
            .map(|kind| (kind, self.count(tenant_id, kind)))
            .filter(|(_, remaining)| *remaining > 0)
            .collect()
    }

    fn is_protected(&self, _row: &DataRow) -> bool {
        #[cfg(test)]
        {
            self.undeletable.contains(&_row.data_type)
        }
        #[cfg(not(test))]
        {
            false
        }
    }

    /// Removes the selected rows plus anything that cascades from a removed
    /// product. Returns how many selected rows went.
    fn delete_rows(&mut self, mut selected: impl FnMut(&DataRow) -> bool) -> u64 {
        let mut removed_products = HashSet::new();
        let mut removed = 0;
        let rows = std::mem::take(&mut self.rows);
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if selected(&row) && !self.is_protected(&row) {
                if row.data_type == DataType::Products {
                    removed_products.insert(row.id);
                }
                removed += 1;
            } else {
                kept.push(row);
            }
        }
        kept.retain(|row| {
            !(row.data_type.entity().cascades_from_products()
                && row
                    .product_id
                    .is_some_and(|product| removed_products.contains(&product)))
        });
        self.rows = kept;
        removed
    }

    fn active_policy(&self, tenant_id: TenantId, data_type: DataType) -> Option<&RetentionPolicy> {
        self.policies.iter().find(|p| {
            p.tenant_id == tenant_id && p.data_type == data_type && p.status == PolicyStatus::Active
        })
    }

    fn retire_policy(
        &mut self,
        tenant_id: TenantId,
        data_type: DataType,
        status: PolicyStatus,
    ) -> Option<RetentionPolicy> {
        let policy = self.policies.iter_mut().find(|p| {
            p.tenant_id == tenant_id && p.data_type == data_type && p.status == PolicyStatus::Active
        })?;
        policy.status = status;
        policy.retired_at = Some(super::now());
        Some(policy.clone())
    }

    fn push_policy(&mut self, tenant_id: TenantId, draft: PolicyDraft, version: i32) -> RetentionPolicy {
        let policy = RetentionPolicy {
            id: Uuid::new_v4(),
            tenant_id,
            data_type: draft.data_type,
            retention_days: draft.retention_days,
            auto_delete: draft.auto_delete,
            status: PolicyStatus::Active,
            version,
            created_at: super::now(),
            retired_at: None,
        };
        self.policies.push(policy.clone());
        policy
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a synced vendor row (what the POS sync would write).
    ///
    /// Not checked against erasure, so tests can plant rows that slipped in
    /// around an erasure.
    pub fn insert_row(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        recorded_at: DateTime<Utc>,
        product_id: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state().rows.push(DataRow {
            id,
            tenant_id: ctx.tenant_id(),
            data_type,
            product_id,
            recorded_at,
        });
        id
    }

    pub fn insert_rows(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        recorded_at: DateTime<Utc>,
        count: usize,
    ) -> Vec<Uuid> {
        (0..count)
            .map(|_| self.insert_row(ctx, data_type, recorded_at, None))
            .collect()
    }

    /// Rows of one data type visible to the bound tenant.
    pub fn visible_rows(&self, ctx: &TenantContext, data_type: DataType) -> Vec<Uuid> {
        self.state()
            .rows
            .iter()
            .filter(|r| r.tenant_id == ctx.tenant_id() && r.data_type == data_type)
            .map(|r| r.id)
            .collect()
    }

    /// Makes rows of a data type survive deletes, as a missing cascade would.
    #[cfg(test)]
    pub(crate) fn make_undeletable(&self, data_type: DataType) {
        self.state().undeletable.insert(data_type);
    }

    #[cfg(test)]
    pub(crate) fn clear_undeletable(&self) {
        self.state().undeletable.clear();
    }

    /// Rewrites a persisted audit entry behind the trail's back.
    #[cfg(test)]
    pub(crate) fn tamper_audit_entry(
        &self,
        tenant_id: TenantId,
        sequence_no: i64,
        tamper: impl FnOnce(&mut AuditLogEntry),
    ) {
        let mut state = self.state();
        if let Some(entry) = state
            .audit
            .iter_mut()
            .find(|e| e.tenant_id == tenant_id && e.sequence_no == sequence_no)
        {
            tamper(entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn remove_audit_entry(&self, tenant_id: TenantId, sequence_no: i64) {
        self.state()
            .audit
            .retain(|e| !(e.tenant_id == tenant_id && e.sequence_no == sequence_no));
    }
}

#[async_trait]
impl TenantRegistry for MemoryStore {
    async fn register_tenant(&self, tenant: TenantId) -> StoreResult<()> {
        let mut state = self.state();
        state.ensure_live(tenant)?;
        state.tenants.entry(tenant).or_insert(None);
        Ok(())
    }

    async fn list_active_tenants(&self) -> StoreResult<Vec<TenantId>> {
        Ok(self
            .state()
            .tenants
            .iter()
            .filter(|(_, erased_at)| erased_at.is_none())
            .map(|(id, _)| *id)
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn upsert_credential(
        &self,
        ctx: &TenantContext,
        sealed: SealedCredential,
    ) -> StoreResult<Credential> {
        let now = super::now();
        let mut state = self.state();
        state.ensure_live(ctx.tenant_id())?;
        let existing = state
            .credentials
            .iter_mut()
            .find(|c| c.tenant_id == ctx.tenant_id() && c.provider == sealed.provider);

        let credential = match existing {
            Some(credential) => {
                credential.encrypted_access_token = sealed.encrypted_access_token;
                credential.encrypted_refresh_token = sealed.encrypted_refresh_token;
                credential.expires_at = sealed.expires_at;
                credential.merchant_id = sealed.merchant_id;
                credential.scopes = sealed.scopes;
                credential.is_active = true;
                credential.last_refresh_at = None;
                credential.updated_at = now;
                credential.clone()
            }
            None => {
                let credential = Credential {
                    id: Uuid::new_v4(),
                    tenant_id: ctx.tenant_id(),
                    provider: sealed.provider,
                    encrypted_access_token: sealed.encrypted_access_token,
                    encrypted_refresh_token: sealed.encrypted_refresh_token,
                    expires_at: sealed.expires_at,
                    merchant_id: sealed.merchant_id,
                    scopes: sealed.scopes,
                    is_active: true,
                    last_refresh_at: None,
                    created_at: now,
                    updated_at: now,
                };
                state.credentials.push(credential.clone());
                credential
            }
        };

        Ok(credential)
    }

    async fn find_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> StoreResult<Option<Credential>> {
        Ok(self
            .state()
            .credentials
            .iter()
            .find(|c| c.tenant_id == ctx.tenant_id() && c.provider == provider)
            .cloned())
    }

    async fn update_credential_tokens(
        &self,
        ctx: &TenantContext,
        provider: &str,
        tokens: SealedTokens,
    ) -> StoreResult<Credential> {
        let now = super::now();
        let mut state = self.state();
        let credential = state
            .credentials
            .iter_mut()
            .find(|c| c.tenant_id == ctx.tenant_id() && c.provider == provider && c.is_active)
            .ok_or_else(|| StoreError::NotFound(format!("active {} credential", provider)))?;

        credential.encrypted_access_token = tokens.encrypted_access_token;
        credential.encrypted_refresh_token = tokens.encrypted_refresh_token;
        credential.expires_at = tokens.expires_at;
        credential.last_refresh_at = Some(now);
        credential.updated_at = now;

        Ok(credential.clone())
    }

    async fn deactivate_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        match state
            .credentials
            .iter_mut()
            .find(|c| c.tenant_id == ctx.tenant_id() && c.provider == provider && c.is_active)
        {
            Some(credential) => {
                credential.is_active = false;
                credential.updated_at = super::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn audit_tip(&self, ctx: &TenantContext) -> StoreResult<Option<AuditLogEntry>> {
        Ok(self
            .state()
            .audit
            .iter()
            .filter(|e| e.tenant_id == ctx.tenant_id())
            .max_by_key(|e| e.sequence_no)
            .cloned())
    }

    async fn append_audit_entry(
        &self,
        ctx: &TenantContext,
        entry: &AuditLogEntry,
    ) -> StoreResult<()> {
        ctx.authorize(entry.tenant_id)
            .map_err(|e| StoreError::Isolation(e.to_string()))?;

        let mut state = self.state();
        if !entry.action.allowed_after_erasure() {
            state.ensure_live(entry.tenant_id)?;
        }
        if state
            .audit
            .iter()
            .any(|e| e.tenant_id == entry.tenant_id && e.sequence_no == entry.sequence_no)
        {
            return Err(StoreError::Conflict(format!(
                "audit sequence {} already taken",
                entry.sequence_no
            )));
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_chain(&self, ctx: &TenantContext) -> StoreResult<Vec<AuditLogEntry>> {
        let mut entries: Vec<_> = self
            .state()
            .audit
            .iter()
            .filter(|e| e.tenant_id == ctx.tenant_id())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence_no);
        Ok(entries)
    }

    async fn audit_entries_by_action(
        &self,
        ctx: &TenantContext,
        action: AuditAction,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let mut entries: Vec<_> = self
            .state()
            .audit
            .iter()
            .filter(|e| {
                e.tenant_id == ctx.tenant_id()
                    && e.action == action
                    && since.map_or(true, |since| e.timestamp >= since)
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence_no);
        Ok(entries)
    }
}

#[async_trait]
impl RetentionStore for MemoryStore {
    async fn find_active_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>> {
        Ok(self.state().active_policy(ctx.tenant_id(), data_type).cloned())
    }

    async fn insert_policy(
        &self,
        ctx: &TenantContext,
        draft: PolicyDraft,
    ) -> StoreResult<RetentionPolicy> {
        let mut state = self.state();
        state.ensure_live(ctx.tenant_id())?;
        if state.active_policy(ctx.tenant_id(), draft.data_type).is_some() {
            return Err(StoreError::Conflict(format!(
                "active {} policy exists",
                draft.data_type
            )));
        }
        Ok(state.push_policy(ctx.tenant_id(), draft, 1))
    }

    async fn supersede_policy(
        &self,
        ctx: &TenantContext,
        draft: PolicyDraft,
    ) -> StoreResult<(RetentionPolicy, RetentionPolicy)> {
        let mut state = self.state();
        state.ensure_live(ctx.tenant_id())?;
        let retired = state
            .retire_policy(ctx.tenant_id(), draft.data_type, PolicyStatus::Superseded)
            .ok_or_else(|| StoreError::NotFound(format!("active {} policy", draft.data_type)))?;
        let created = state.push_policy(ctx.tenant_id(), draft, retired.version + 1);
        Ok((retired, created))
    }

    async fn disable_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> StoreResult<Option<RetentionPolicy>> {
        Ok(self
            .state()
            .retire_policy(ctx.tenant_id(), data_type, PolicyStatus::Disabled))
    }

    async fn list_active_policies(&self, ctx: &TenantContext) -> StoreResult<Vec<RetentionPolicy>> {
        let mut policies: Vec<_> = self
            .state()
            .policies
            .iter()
            .filter(|p| p.tenant_id == ctx.tenant_id() && p.status == PolicyStatus::Active)
            .cloned()
            .collect();
        policies.sort_by_key(|p| p.data_type.as_str());
        Ok(policies)
    }

    async fn count_rows(&self, ctx: &TenantContext, data_type: DataType) -> StoreResult<u64> {
        Ok(self.state().count(ctx.tenant_id(), data_type.entity()))
    }

    async fn count_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        Ok(self
            .state()
            .rows
            .iter()
            .filter(|r| {
                r.tenant_id == ctx.tenant_id() && r.data_type == data_type && r.recorded_at < cutoff
            })
            .count() as u64)
    }

    async fn delete_rows_before(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let tenant_id = ctx.tenant_id();
        Ok(self.state().delete_rows(|r| {
            r.tenant_id == tenant_id && r.data_type == data_type && r.recorded_at < cutoff
        }))
    }
}

#[async_trait]
impl ErasureStore for MemoryStore {
    async fn tenant_row_counts(
        &self,
        ctx: &TenantContext,
    ) -> StoreResult<BTreeMap<EntityKind, u64>> {
        Ok(self.state().residue(ctx.tenant_id()))
    }

    async fn purge_tenant(
        &self,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> StoreResult<PurgeOutcome> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state();

        // Work on a copy so residue or cancellation leaves nothing applied.
        let mut staged = MemoryState {
            tenants: state.tenants.clone(),
            credentials: state.credentials.clone(),
            audit: Vec::new(),
            policies: state.policies.clone(),
            rows: state.rows.clone(),
            deletion_results: BTreeMap::new(),
            #[cfg(test)]
            undeletable: state.undeletable.clone(),
        };

        let mut per_entity_counts = BTreeMap::new();
        for kind in EntityKind::ERASURE_ORDER {
            if cancel.is_cancelled() {
                return Ok(PurgeOutcome::Cancelled);
            }
            let removed = match kind {
                EntityKind::Credentials => {
                    let before = staged.credentials.len();
                    staged.credentials.retain(|c| c.tenant_id != tenant_id);
                    (before - staged.credentials.len()) as u64
                }
                EntityKind::RetentionPolicies => {
                    let before = staged.policies.len();
                    staged.policies.retain(|p| p.tenant_id != tenant_id);
                    (before - staged.policies.len()) as u64
                }
                data_kind => staged
                    .delete_rows(|r| r.tenant_id == tenant_id && r.data_type.entity() == data_kind),
            };
            if removed > 0 {
                per_entity_counts.insert(kind, removed);
            }
        }

        let residue = staged.residue(tenant_id);
        if !residue.is_empty() {
            return Ok(PurgeOutcome::Residue(residue));
        }

        let result = DeletionResult {
            tenant_id,
            per_entity_counts,
            verified: true,
            timestamp: super::now(),
        };
        state.credentials = staged.credentials;
        state.policies = staged.policies;
        state.rows = staged.rows;
        state
            .tenants
            .entry(tenant_id)
            .and_modify(|erased_at| {
                erased_at.get_or_insert(result.timestamp);
            })
            .or_insert(Some(result.timestamp));
        state.deletion_results.insert(tenant_id, result.clone());

        Ok(PurgeOutcome::Purged(result))
    }

    async fn find_deletion_result(
        &self,
        ctx: &TenantContext,
    ) -> StoreResult<Option<DeletionResult>> {
        Ok(self.state().deletion_results.get(&ctx.tenant_id()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx() -> TenantContext {
        TenantContext::bind(TenantId::generate(), "vendor@example.com")
    }

    #[tokio::test]
    async fn test_queries_bound_to_a_never_see_b_rows() {
        let store = MemoryStore::new();
        let a = ctx();
        let b = ctx();
        let old = Utc::now() - Duration::days(90);

        store.insert_rows(&b, DataType::Sales, old, 4);
        store.insert_rows(&a, DataType::Sales, old, 1);

        assert_eq!(store.count_rows(&a, DataType::Sales).await.unwrap(), 1);
        assert_eq!(store.visible_rows(&a, DataType::Sales).len(), 1);
        assert_eq!(
            store
                .delete_rows_before(&a, DataType::Sales, Utc::now())
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.count_rows(&b, DataType::Sales).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_append_for_foreign_tenant_is_violation() {
        let store = MemoryStore::new();
        let a = ctx();
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            tenant_id: TenantId::generate(),
            sequence_no: 0,
            actor: "x".into(),
            action: AuditAction::Create,
            resource_type: "product".into(),
            resource_id: "p1".into(),
            old_values: None,
            new_values: None,
            prev_hash: String::new(),
            entry_hash: String::new(),
            timestamp: Utc::now(),
        };

        let result = store.append_audit_entry(&a, &entry).await;
        assert!(matches!(result, Err(StoreError::Isolation(_))));
    }

    #[tokio::test]
    async fn test_deleting_products_cascades_to_children() {
        let store = MemoryStore::new();
        let a = ctx();
        let old = Utc::now() - Duration::days(400);
        let product = store.insert_row(&a, DataType::Products, old, None);
        store.insert_row(&a, DataType::Sales, Utc::now(), Some(product));
        store.insert_row(&a, DataType::Sales, Utc::now(), None);

        let deleted = store
            .delete_rows_before(&a, DataType::Products, Utc::now() - Duration::days(365))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.count_rows(&a, DataType::Sales).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_active_policy_conflicts() {
        let store = MemoryStore::new();
        let a = ctx();
        let draft = PolicyDraft {
            data_type: DataType::Sales,
            retention_days: 30,
            auto_delete: true,
        };

        store.insert_policy(&a, draft).await.unwrap();
        let second = store.insert_policy(&a, draft).await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_erased_tenant_refuses_new_rows() {
        let store = MemoryStore::new();
        let a = ctx();
        let draft = PolicyDraft {
            data_type: DataType::Sales,
            retention_days: 30,
            auto_delete: true,
        };
        store.register_tenant(a.tenant_id()).await.unwrap();
        store.insert_policy(&a, draft).await.unwrap();

        let outcome = store
            .purge_tenant(&a, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, PurgeOutcome::Purged(_)));

        assert!(matches!(
            store.register_tenant(a.tenant_id()).await,
            Err(StoreError::TenantErased(_))
        ));
        assert!(matches!(
            store.insert_policy(&a, draft).await,
            Err(StoreError::TenantErased(_))
        ));
        assert!(store.list_active_tenants().await.unwrap().is_empty());

        let entry = |sequence_no, action| AuditLogEntry {
            id: Uuid::new_v4(),
            tenant_id: a.tenant_id(),
            sequence_no,
            actor: "x".into(),
            action,
            resource_type: "tenant".into(),
            resource_id: a.tenant_id().to_string(),
            old_values: None,
            new_values: None,
            prev_hash: String::new(),
            entry_hash: String::new(),
            timestamp: Utc::now(),
        };
        assert!(matches!(
            store.append_audit_entry(&a, &entry(0, AuditAction::Update)).await,
            Err(StoreError::TenantErased(_))
        ));
        store
            .append_audit_entry(&a, &entry(0, AuditAction::TenantErased))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_with_residue_applies_nothing() {
        let store = MemoryStore::new();
        let a = ctx();
        store.insert_rows(&a, DataType::Sales, Utc::now(), 3);
        store.insert_rows(&a, DataType::Products, Utc::now(), 2);
        store.make_undeletable(DataType::Products);

        let outcome = store
            .purge_tenant(&a, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PurgeOutcome::Residue(BTreeMap::from([(EntityKind::Products, 2)]))
        );
        assert_eq!(store.count_rows(&a, DataType::Sales).await.unwrap(), 3);
        assert!(store.find_deletion_result(&a).await.unwrap().is_none());
    }
}
