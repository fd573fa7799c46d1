use axum::{extract::State, routing::delete, Json, Router};
use tower_sessions::Session;

use crate::api::middleware::session::AppState;
use crate::api::middleware::tenant::Tenant;
use crate::error::{AppError, Result};
use crate::models::DeletionResult;

/// Erase everything the session's tenant owns, then end the session
async fn erase_tenant(
    State(state): State<AppState>,
    session: Session,
    Tenant(ctx): Tenant,
) -> Result<Json<DeletionResult>> {
    let cancel = state.shutdown.child_token();
    let result = state
        .governance
        .deletion
        .delete_tenant_data(&ctx, &cancel)
        .await?;

    tracing::info!(
        tenant_id = %result.tenant_id,
        rows_deleted = result.total_deleted(),
        "Tenant erased"
    );

    session
        .flush()
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(Json(result))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/tenant", delete(erase_tenant))
}
