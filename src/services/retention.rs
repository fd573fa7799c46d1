use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::db::{self, GovernanceStore, StoreError};
use crate::error::GovernanceError;
use crate::models::{AuditAction, AuditEvent, DataType, PolicyDraft, RetentionPolicy};
use crate::services::audit::AuditTrail;
use crate::tenant::{KeyedMutex, TenantContext, TenantGate, TenantId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnforcementStats {
    /// Rows of the data type held by the tenant when the policy ran.
    pub evaluated_count: u64,
    /// Rows older than the policy cutoff.
    pub matched_count: u64,
    pub deleted_count: u64,
}

/// Per data type outcome of one enforcement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnforcementReport(BTreeMap<DataType, EnforcementStats>);

impl EnforcementReport {
    pub fn get(&self, data_type: DataType) -> Option<&EnforcementStats> {
        self.0.get(&data_type)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_deleted(&self) -> u64 {
        self.0.values().map(|stats| stats.deleted_count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataType, &EnforcementStats)> {
        self.0.iter()
    }
}

pub struct RetentionEngine {
    store: Arc<dyn GovernanceStore>,
    audit: Arc<AuditTrail>,
    gate: Arc<TenantGate>,
    passes: KeyedMutex<TenantId>,
    default_retention_days: i32,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        audit: Arc<AuditTrail>,
        gate: Arc<TenantGate>,
        default_retention_days: i32,
    ) -> Self {
        Self {
            store,
            audit,
            gate,
            passes: KeyedMutex::new(),
            default_retention_days,
        }
    }

    /// Retention applied when a policy request does not name one.
    pub fn default_retention_days(&self) -> i32 {
        self.default_retention_days
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn create_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        retention_days: i32,
        auto_delete: bool,
    ) -> Result<RetentionPolicy, GovernanceError> {
        let draft = validate(data_type, retention_days, auto_delete)?;
        let _gate = self.gate.shared(ctx.tenant_id()).await;

        if let Some(active) = self.store.find_active_policy(ctx, data_type).await? {
            return Err(GovernanceError::RetentionPolicyConflict {
                data_type,
                version: active.version,
            });
        }

        self.store.register_tenant(ctx.tenant_id()).await?;
        let policy = match self.store.insert_policy(ctx, draft).await {
            Ok(policy) => policy,
            // Lost a race with a concurrent create.
            Err(StoreError::Conflict(_)) => {
                let version = self
                    .store
                    .find_active_policy(ctx, data_type)
                    .await?
                    .map_or(1, |active| active.version);
                return Err(GovernanceError::RetentionPolicyConflict { data_type, version });
            }
            Err(e) => return Err(e.into()),
        };
        ctx.authorize(policy.tenant_id)?;

        self.audit
            .append(
                ctx,
                AuditEvent::new(AuditAction::PolicyCreated, "retention_policy", data_type.as_str())
                    .with_new_values(policy_values(&policy)),
            )
            .await?;

        tracing::info!(version = policy.version, "Retention policy created");
        Ok(policy)
    }

    /// Replaces the active policy with a new version; the old one is kept as
    /// superseded.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn update_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
        retention_days: i32,
        auto_delete: bool,
    ) -> Result<RetentionPolicy, GovernanceError> {
        let draft = validate(data_type, retention_days, auto_delete)?;
        let _gate = self.gate.shared(ctx.tenant_id()).await;

        let (retired, created) = match self.store.supersede_policy(ctx, draft).await {
            Ok(pair) => pair,
            Err(StoreError::NotFound(_)) => return Err(GovernanceError::PolicyNotFound(data_type)),
            // A concurrent update took the next version first.
            Err(StoreError::Conflict(_)) => {
                let version = self
                    .store
                    .find_active_policy(ctx, data_type)
                    .await?
                    .map_or(0, |active| active.version);
                return Err(GovernanceError::RetentionPolicyConflict { data_type, version });
            }
            Err(e) => return Err(e.into()),
        };
        ctx.authorize(created.tenant_id)?;

        self.audit
            .append(
                ctx,
                AuditEvent::new(
                    AuditAction::PolicySuperseded,
                    "retention_policy",
                    data_type.as_str(),
                )
                .with_old_values(policy_values(&retired))
                .with_new_values(policy_values(&created)),
            )
            .await?;

        tracing::info!(version = created.version, "Retention policy superseded");
        Ok(created)
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn disable_policy(
        &self,
        ctx: &TenantContext,
        data_type: DataType,
    ) -> Result<RetentionPolicy, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;

        let disabled = self
            .store
            .disable_policy(ctx, data_type)
            .await?
            .ok_or(GovernanceError::PolicyNotFound(data_type))?;
        ctx.authorize(disabled.tenant_id)?;

        self.audit
            .append(
                ctx,
                AuditEvent::new(AuditAction::PolicyDisabled, "retention_policy", data_type.as_str())
                    .with_old_values(policy_values(&disabled)),
            )
            .await?;

        tracing::info!(version = disabled.version, "Retention policy disabled");
        Ok(disabled)
    }

    pub async fn list_policies(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<RetentionPolicy>, GovernanceError> {
        let policies = self.store.list_active_policies(ctx).await?;
        for policy in &policies {
            ctx.authorize(policy.tenant_id)?;
        }
        Ok(policies)
    }

    /// On-demand enforcement. Waits for a pass already running against the
    /// tenant rather than overlapping it.
    #[tracing::instrument(skip(self, ctx, cancel), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn enforce_all_policies(
        &self,
        ctx: &TenantContext,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<EnforcementReport, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;
        let _pass = self.passes.lock(ctx.tenant_id()).await;
        self.run_pass(ctx, dry_run, cancel).await
    }

    /// Periodic enforcement. Returns `None` without doing anything when a
    /// pass is already running for the tenant; the next tick picks up
    /// whatever it left.
    pub async fn run_scheduled_tick(
        &self,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> Result<Option<EnforcementReport>, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;
        let Some(_pass) = self.passes.try_lock(ctx.tenant_id()) else {
            tracing::debug!(tenant_id = %ctx.tenant_id(), "Enforcement already in flight, skipping tick");
            return Ok(None);
        };
        self.run_pass(ctx, false, cancel).await.map(Some)
    }

    async fn run_pass(
        &self,
        ctx: &TenantContext,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<EnforcementReport, GovernanceError> {
        let mut policies = self.list_policies(ctx).await?;
        // Children before products, so their own counts are taken before a
        // product delete cascades into them.
        policies.sort_by_key(|policy| policy.data_type.entity());

        let now = db::now();
        let mut report = EnforcementReport::default();
        for policy in &policies {
            if cancel.is_cancelled() {
                tracing::warn!(completed = report.len(), "Retention enforcement cancelled");
                return Err(GovernanceError::EnforcementCancelled { completed: report });
            }

            match self.enforce_policy(ctx, policy, now, dry_run).await {
                Ok(stats) => {
                    report.0.insert(policy.data_type, stats);
                }
                Err(e) => {
                    tracing::error!(
                        data_type = %policy.data_type,
                        completed = ?report,
                        error = %e,
                        "Retention enforcement failed"
                    );
                    return Err(e);
                }
            }
        }

        tracing::info!(
            policies = report.len(),
            deleted = report.total_deleted(),
            dry_run,
            "Retention enforcement completed"
        );
        Ok(report)
    }

    async fn enforce_policy(
        &self,
        ctx: &TenantContext,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<EnforcementStats, GovernanceError> {
        let data_type = policy.data_type;
        let cutoff = policy.cutoff(now);

        let evaluated_count = self.store.count_rows(ctx, data_type).await?;
        let matched_count = self.store.count_rows_before(ctx, data_type, cutoff).await?;

        let mut deleted_count = 0;
        if policy.auto_delete && !dry_run && matched_count > 0 {
            deleted_count = self.store.delete_rows_before(ctx, data_type, cutoff).await?;
        }

        if deleted_count > 0 {
            self.audit
                .append(
                    ctx,
                    AuditEvent::new(AuditAction::RetentionDelete, data_type.as_str(), "*")
                        .with_new_values(json!({
                            "policy_version": policy.version,
                            "retention_days": policy.retention_days,
                            "cutoff": cutoff,
                            "matched_count": matched_count,
                            "deleted_count": deleted_count,
                        })),
                )
                .await?;
            tracing::info!(
                tenant_id = %ctx.tenant_id(),
                data_type = %data_type,
                deleted_count,
                "Expired rows deleted"
            );
        }

        Ok(EnforcementStats {
            evaluated_count,
            matched_count,
            deleted_count,
        })
    }
}

fn validate(
    data_type: DataType,
    retention_days: i32,
    auto_delete: bool,
) -> Result<PolicyDraft, GovernanceError> {
    if retention_days <= 0 {
        return Err(GovernanceError::Validation(format!(
            "retention_days must be positive, got {}",
            retention_days
        )));
    }
    Ok(PolicyDraft {
        data_type,
        retention_days,
        auto_delete,
    })
}

fn policy_values(policy: &RetentionPolicy) -> serde_json::Value {
    json!({
        "version": policy.version,
        "retention_days": policy.retention_days,
        "auto_delete": policy.auto_delete,
        "status": policy.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, RetentionStore};
    use crate::models::PolicyStatus;
    use chrono::Duration;

    struct Fixture {
        engine: RetentionEngine,
        audit: Arc<AuditTrail>,
        store: Arc<MemoryStore>,
        ctx: TenantContext,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(TenantGate::new());
        let audit = Arc::new(AuditTrail::new(store.clone(), gate.clone()));
        let engine = RetentionEngine::new(store.clone(), audit.clone(), gate, 365);
        Fixture {
            engine,
            audit,
            store,
            ctx: TenantContext::bind(TenantId::generate(), "vendor@example.com"),
        }
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - Duration::days(days)
    }

    #[tokio::test]
    async fn test_expired_sales_deleted_newer_kept() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        f.store.insert_rows(&f.ctx, DataType::Sales, days_ago(45), 5);
        f.store.insert_rows(&f.ctx, DataType::Sales, days_ago(3), 3);

        let report = f
            .engine
            .enforce_all_policies(&f.ctx, false, &CancellationToken::new())
            .await
            .unwrap();

        let sales = report.get(DataType::Sales).unwrap();
        assert_eq!(sales.evaluated_count, 8);
        assert_eq!(sales.matched_count, 5);
        assert_eq!(sales.deleted_count, 5);
        assert_eq!(f.store.count_rows(&f.ctx, DataType::Sales).await.unwrap(), 3);
        assert_eq!(
            f.audit
                .count_actions(&f.ctx, AuditAction::RetentionDelete)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_second_run_deletes_nothing() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        f.engine
            .create_policy(&f.ctx, DataType::SyncEvents, 7, true)
            .await
            .unwrap();
        f.store.insert_rows(&f.ctx, DataType::Sales, days_ago(60), 4);
        f.store.insert_rows(&f.ctx, DataType::SyncEvents, days_ago(10), 2);

        let cancel = CancellationToken::new();
        let first = f
            .engine
            .enforce_all_policies(&f.ctx, false, &cancel)
            .await
            .unwrap();
        let second = f
            .engine
            .enforce_all_policies(&f.ctx, false, &cancel)
            .await
            .unwrap();

        assert_eq!(first.total_deleted(), 6);
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|(_, stats)| stats.deleted_count == 0));
        assert_eq!(
            f.audit
                .count_actions(&f.ctx, AuditAction::RetentionDelete)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_dry_run_and_manual_policies_only_report() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        f.engine
            .create_policy(&f.ctx, DataType::Recommendations, 30, false)
            .await
            .unwrap();
        f.store.insert_rows(&f.ctx, DataType::Sales, days_ago(90), 2);
        f.store
            .insert_rows(&f.ctx, DataType::Recommendations, days_ago(90), 3);

        let cancel = CancellationToken::new();
        let dry = f
            .engine
            .enforce_all_policies(&f.ctx, true, &cancel)
            .await
            .unwrap();
        assert_eq!(dry.get(DataType::Sales).unwrap().matched_count, 2);
        assert_eq!(dry.total_deleted(), 0);

        let real = f
            .engine
            .enforce_all_policies(&f.ctx, false, &cancel)
            .await
            .unwrap();
        assert_eq!(real.get(DataType::Sales).unwrap().deleted_count, 2);
        let recommendations = real.get(DataType::Recommendations).unwrap();
        assert_eq!(recommendations.matched_count, 3);
        assert_eq!(recommendations.deleted_count, 0);
    }

    #[tokio::test]
    async fn test_enforcement_never_touches_other_tenants() {
        let f = fixture();
        let other = TenantContext::bind(TenantId::generate(), "other@example.com");
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        f.store.insert_rows(&other, DataType::Sales, days_ago(90), 4);

        let report = f
            .engine
            .enforce_all_policies(&f.ctx, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.get(DataType::Sales).unwrap().evaluated_count, 0);
        assert_eq!(f.store.count_rows(&other, DataType::Sales).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_second_active_policy_is_a_conflict() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Products, 365, true)
            .await
            .unwrap();

        let err = f
            .engine
            .create_policy(&f.ctx, DataType::Products, 30, true)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GovernanceError::RetentionPolicyConflict {
                data_type: DataType::Products,
                version: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_non_positive_retention_rejected() {
        let f = fixture();
        let err = f
            .engine
            .create_policy(&f.ctx, DataType::Sales, 0, true)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_supersedes_and_disable_retires() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();

        let updated = f
            .engine
            .update_policy(&f.ctx, DataType::Sales, 90, false)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.retention_days, 90);

        let active = f.engine.list_policies(&f.ctx).await.unwrap();
        assert_eq!(active, vec![updated.clone()]);

        let disabled = f
            .engine
            .disable_policy(&f.ctx, DataType::Sales)
            .await
            .unwrap();
        assert_eq!(disabled.status, PolicyStatus::Disabled);
        assert!(f.engine.list_policies(&f.ctx).await.unwrap().is_empty());

        assert!(matches!(
            f.engine.update_policy(&f.ctx, DataType::Sales, 10, true).await,
            Err(GovernanceError::PolicyNotFound(DataType::Sales))
        ));
        assert!(f.audit.verify_chain(&f.ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_pass_reports_completed_work() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .engine
            .enforce_all_policies(&f.ctx, false, &cancel)
            .await
            .unwrap_err();

        match err {
            GovernanceError::EnforcementCancelled { completed } => assert!(completed.is_empty()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scheduled_tick_skips_when_pass_in_flight() {
        let f = fixture();
        f.engine
            .create_policy(&f.ctx, DataType::Sales, 30, true)
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let held = f.engine.passes.try_lock(f.ctx.tenant_id()).unwrap();
        let skipped = f.engine.run_scheduled_tick(&f.ctx, &cancel).await.unwrap();
        assert!(skipped.is_none());

        drop(held);
        let ran = f.engine.run_scheduled_tick(&f.ctx, &cancel).await.unwrap();
        assert!(ran.is_some());
    }

    #[test]
    fn test_report_serializes_by_data_type() {
        let mut report = EnforcementReport::default();
        report.0.insert(
            DataType::Sales,
            EnforcementStats {
                evaluated_count: 8,
                matched_count: 5,
                deleted_count: 5,
            },
        );

        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({ "sales": { "evaluated_count": 8, "matched_count": 5, "deleted_count": 5 } })
        );
    }
}
