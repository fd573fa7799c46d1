use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;

use crate::error::GovernanceError;
use crate::services::Governance;
use crate::tenant::{TenantContext, SYSTEM_RETENTION_ACTOR};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub tenants_checked: usize,
    pub passes_run: usize,
    pub skipped_in_flight: usize,
    pub rows_deleted: u64,
    pub failures: usize,
}

/// Background job that enforces retention for every active tenant
///
/// For each tenant not yet erased:
/// 1. Bind a system context for the tenant
/// 2. Run a scheduled tick, skipping tenants with a pass already in flight
/// 3. Log failures and move on; enforcement is idempotent, so the next
///    sweep resumes whatever this one left
pub async fn sweep_tenants(
    governance: &Governance,
    cancel: &CancellationToken,
) -> Result<SweepStats, GovernanceError> {
    let mut stats = SweepStats::default();
    let tenants = governance.store.list_active_tenants().await?;

    tracing::info!(tenants = tenants.len(), "Starting retention sweep");

    for tenant_id in tenants {
        if cancel.is_cancelled() {
            tracing::warn!(?stats, "Retention sweep cancelled");
            return Ok(stats);
        }

        stats.tenants_checked += 1;
        let ctx = TenantContext::system(tenant_id, SYSTEM_RETENTION_ACTOR);

        match governance.retention.run_scheduled_tick(&ctx, cancel).await {
            Ok(Some(report)) => {
                stats.passes_run += 1;
                stats.rows_deleted += report.total_deleted();
            }
            Ok(None) => {
                stats.skipped_in_flight += 1;
            }
            Err(GovernanceError::EnforcementCancelled { completed }) => {
                stats.rows_deleted += completed.total_deleted();
                tracing::warn!(?stats, "Retention sweep cancelled");
                return Ok(stats);
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Retention enforcement failed for tenant"
                );
                stats.failures += 1;
            }
        }
    }

    tracing::info!(?stats, "Retention sweep completed");

    Ok(stats)
}

/// Schedules [`sweep_tenants`] on a cron expression (with seconds field).
pub async fn start_retention_scheduler(
    governance: Governance,
    schedule: &str,
    cancel: CancellationToken,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_id, _scheduler| {
        let governance = governance.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if let Err(e) = sweep_tenants(&governance, &cancel).await {
                tracing::error!(error = %e, "Retention sweep failed");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(schedule, "Retention scheduler started");
    Ok(scheduler)
}
