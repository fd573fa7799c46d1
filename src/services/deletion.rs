use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::db::{GovernanceStore, PurgeOutcome};
use crate::error::GovernanceError;
use crate::models::{AuditAction, AuditEvent, DeletionResult};
use crate::services::audit::AuditTrail;
use crate::tenant::{TenantContext, TenantGate};

/// Right-to-erasure for a whole tenant.
///
/// Everything tenant-scoped goes except the audit chain, which is kept and
/// closed with a single `TENANT_ERASED` entry. Once erased, the store refuses
/// new rows for the tenant.
pub struct DeletionOrchestrator {
    store: Arc<dyn GovernanceStore>,
    audit: Arc<AuditTrail>,
    gate: Arc<TenantGate>,
}

impl DeletionOrchestrator {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        audit: Arc<AuditTrail>,
        gate: Arc<TenantGate>,
    ) -> Self {
        Self { store, audit, gate }
    }

    /// Erases the tenant's data and returns the verified result.
    ///
    /// Safe to call again after any failure: a rolled-back purge is simply
    /// re-run, and a committed one returns its persisted result. Rows found
    /// under an already erased tenant are purged again and recorded as
    /// `TENANT_RESIDUE_PURGED`.
    #[tracing::instrument(skip(self, ctx, cancel), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn delete_tenant_data(
        &self,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> Result<DeletionResult, GovernanceError> {
        let _exclusive = self.gate.exclusive(ctx.tenant_id()).await;

        let held = self.store.tenant_row_counts(ctx).await?;
        let erased_before = match self.store.find_deletion_result(ctx).await? {
            Some(result) => {
                ctx.authorize(result.tenant_id)?;
                if held.is_empty() {
                    tracing::info!("Tenant already erased, returning recorded result");
                    self.close_chain(ctx, &result).await?;
                    return Ok(result);
                }
                tracing::error!(late_rows = ?held, "Rows found under an erased tenant, purging again");
                true
            }
            None => false,
        };

        if cancel.is_cancelled() {
            return Err(GovernanceError::ErasureCancelled);
        }

        // An erased tenant's chain only takes the erasure's own entries.
        if !erased_before {
            self.audit
                .append(
                    ctx,
                    AuditEvent::new(
                        AuditAction::TenantErasureStarted,
                        "tenant",
                        ctx.tenant_id().to_string(),
                    )
                    .with_old_values(json!(held)),
                )
                .await?;
        }

        match self.store.purge_tenant(ctx, cancel).await? {
            PurgeOutcome::Purged(result) => {
                if erased_before {
                    self.record(ctx, AuditAction::TenantResiduePurged, &result).await?;
                } else {
                    self.close_chain(ctx, &result).await?;
                }
                tracing::info!(
                    total_deleted = result.total_deleted(),
                    "Tenant erased and verified"
                );
                Ok(result)
            }
            PurgeOutcome::Residue(residue) => {
                tracing::error!(residue = ?residue, "Erasure verification found remaining rows, rolled back");
                Err(GovernanceError::DeletionVerificationFailure { residue })
            }
            PurgeOutcome::Cancelled => {
                tracing::warn!("Tenant erasure cancelled, rolled back");
                Err(GovernanceError::ErasureCancelled)
            }
        }
    }

    /// Writes the terminal entry unless an earlier attempt already did.
    async fn close_chain(
        &self,
        ctx: &TenantContext,
        result: &DeletionResult,
    ) -> Result<(), GovernanceError> {
        if self
            .audit
            .count_actions(ctx, AuditAction::TenantErased)
            .await?
            > 0
        {
            return Ok(());
        }
        self.record(ctx, AuditAction::TenantErased, result).await
    }

    async fn record(
        &self,
        ctx: &TenantContext,
        action: AuditAction,
        result: &DeletionResult,
    ) -> Result<(), GovernanceError> {
        let event = AuditEvent::new(action, "tenant", ctx.tenant_id().to_string())
            .with_new_values(json!({
                "per_entity_counts": result.per_entity_counts,
                "total_deleted": result.total_deleted(),
                "verified": result.verified,
                "erased_at": result.timestamp,
            }));
        self.audit.append(ctx, event).await?;
        Ok(())
    }
}
