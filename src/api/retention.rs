use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::session::AppState;
use crate::api::middleware::tenant::Tenant;
use crate::error::Result;
use crate::models::{DataType, RetentionPolicy};
use crate::services::retention::EnforcementReport;
use crate::tenant::TenantId;

fn default_auto_delete() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreatePolicyRequest {
    tenant_id: Option<TenantId>,
    data_type: DataType,
    /// Falls back to the configured default when omitted.
    retention_days: Option<i32>,
    #[serde(default = "default_auto_delete")]
    auto_delete: bool,
}

#[derive(Debug, Deserialize)]
struct UpdatePolicyRequest {
    tenant_id: Option<TenantId>,
    retention_days: i32,
    #[serde(default = "default_auto_delete")]
    auto_delete: bool,
}

#[derive(Debug, Deserialize)]
struct EnforceQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn create_policy(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(body): Json<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<RetentionPolicy>)> {
    ctx.reject_foreign(body.tenant_id)?;

    let engine = &state.governance.retention;
    let retention_days = body
        .retention_days
        .unwrap_or_else(|| engine.default_retention_days());

    let policy = engine
        .create_policy(&ctx, body.data_type, retention_days, body.auto_delete)
        .await?;

    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list_policies(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
) -> Result<Json<Vec<RetentionPolicy>>> {
    Ok(Json(state.governance.retention.list_policies(&ctx).await?))
}

/// Supersede the active policy with a new version
async fn update_policy(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(data_type): Path<DataType>,
    Json(body): Json<UpdatePolicyRequest>,
) -> Result<Json<RetentionPolicy>> {
    ctx.reject_foreign(body.tenant_id)?;

    let policy = state
        .governance
        .retention
        .update_policy(&ctx, data_type, body.retention_days, body.auto_delete)
        .await?;

    Ok(Json(policy))
}

async fn disable_policy(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(data_type): Path<DataType>,
) -> Result<Json<RetentionPolicy>> {
    let policy = state
        .governance
        .retention
        .disable_policy(&ctx, data_type)
        .await?;
    Ok(Json(policy))
}

/// Run one enforcement pass now. Queues behind a pass already in flight.
async fn enforce_policies(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Query(query): Query<EnforceQuery>,
) -> Result<Json<EnforcementReport>> {
    let cancel = state.shutdown.child_token();
    let report = state
        .governance
        .retention
        .enforce_all_policies(&ctx, query.dry_run, &cancel)
        .await?;

    Ok(Json(report))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/retention/policies",
            post(create_policy).get(list_policies),
        )
        .route(
            "/retention/policies/:data_type",
            put(update_policy).delete(disable_policy),
        )
        .route("/retention/enforce", post(enforce_policies))
}
