use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tower_sessions::Session;
use uuid::Uuid;

use super::session::{SESSION_KEY_ACTOR, SESSION_KEY_TENANT_ID};
use crate::error::{AppError, GovernanceError};
use crate::tenant::{TenantContext, TenantId};

/// Binds the session's authenticated tenant to the request.
///
/// The tenant comes from the session only. Handlers that also accept a
/// `tenant_id` in the payload must check it with
/// [`TenantContext::reject_foreign`].
pub async fn bind_tenant(
    session: Session,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let tenant_id: Uuid = session
        .get(SESSION_KEY_TENANT_ID)
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .ok_or(AppError::Unauthorized)?;
    let tenant_id = TenantId::new(tenant_id)?;

    let actor: String = session
        .get(SESSION_KEY_ACTOR)
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .unwrap_or_else(|| format!("tenant:{}", tenant_id));

    request
        .extensions_mut()
        .insert(TenantContext::bind(tenant_id, actor));

    Ok(next.run(request).await)
}

/// Extractor for the tenant bound by [`bind_tenant`].
///
/// A handler reached without a binding is a wiring bug; it fails as an
/// isolation violation instead of running unscoped.
#[derive(Debug, Clone)]
pub struct Tenant(pub TenantContext);

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .map(Tenant)
            .ok_or_else(|| {
                AppError::Governance(GovernanceError::isolation(format!(
                    "{} reached without a bound tenant",
                    parts.uri.path()
                )))
            })
    }
}
