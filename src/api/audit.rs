use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::middleware::session::AppState;
use crate::api::middleware::tenant::Tenant;
use crate::error::Result;
use crate::models::{AuditLogEntry, DataAccessRecord};
use crate::services::audit::ChainVerification;

/// Re-walk the tenant's chain. A broken chain is a 500 and is logged.
async fn verify_chain(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
) -> Result<Json<ChainVerification>> {
    let report = state.governance.audit.ensure_chain_intact(&ctx).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    since: Option<DateTime<Utc>>,
}

async fn export_data_access(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Query(query): Query<ExportQuery>,
) -> Result<Json<Vec<DataAccessRecord>>> {
    let records = state
        .governance
        .audit
        .data_access_export(&ctx, query.since)
        .await?;
    Ok(Json(records))
}

async fn record_data_access(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(record): Json<DataAccessRecord>,
) -> Result<(StatusCode, Json<AuditLogEntry>)> {
    let entry = state.governance.audit.log_data_access(&ctx, record).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/audit/verify", get(verify_chain))
        .route(
            "/audit/data-access",
            get(export_data_access).post(record_data_access),
        )
}
