use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;

use crate::api::middleware::session::AppState;
use crate::api::middleware::tenant::Tenant;
use crate::error::Result;
use crate::models::NewCredential;
use crate::services::vault::CredentialStatus;
use crate::tenant::TenantId;

#[derive(Debug, Deserialize)]
struct LinkCredentialRequest {
    /// Optional; must match the session's tenant when present.
    tenant_id: Option<TenantId>,
    access_token: SecretString,
    refresh_token: SecretString,
    expires_at: DateTime<Utc>,
    merchant_id: String,
    #[serde(default)]
    scopes: Vec<String>,
}

/// Link (or re-link) a POS provider for the session's tenant
async fn link_credential(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(provider): Path<String>,
    Json(body): Json<LinkCredentialRequest>,
) -> Result<Json<CredentialStatus>> {
    ctx.reject_foreign(body.tenant_id)?;

    let vault = &state.governance.vault;
    vault
        .store_credential(
            &ctx,
            NewCredential {
                provider: provider.clone(),
                access_token: body.access_token,
                refresh_token: body.refresh_token,
                expires_at: body.expires_at,
                merchant_id: body.merchant_id,
                scopes: body.scopes,
            },
        )
        .await?;

    Ok(Json(vault.credential_status(&ctx, &provider).await?))
}

async fn credential_status(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(provider): Path<String>,
) -> Result<Json<CredentialStatus>> {
    let status = state
        .governance
        .vault
        .credential_status(&ctx, &provider)
        .await?;
    Ok(Json(status))
}

/// Force a refresh; responds with the new status, never the token
async fn refresh_credential(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(provider): Path<String>,
) -> Result<Json<CredentialStatus>> {
    let vault = &state.governance.vault;
    vault.refresh_now(&ctx, &provider).await?;
    Ok(Json(vault.credential_status(&ctx, &provider).await?))
}

async fn revoke_credential(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(provider): Path<String>,
) -> Result<StatusCode> {
    state
        .governance
        .vault
        .revoke_credential(&ctx, &provider)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/credentials/:provider",
            put(link_credential)
                .get(credential_status)
                .delete(revoke_credential),
        )
        .route("/credentials/:provider/refresh", post(refresh_credential))
}
