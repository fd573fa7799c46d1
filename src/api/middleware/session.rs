use axum::extract::FromRef;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_sessions::{Expiry, SessionManagerLayer};
use tower_sessions_sqlx_store::PostgresStore;

use crate::services::Governance;

/// Session keys written by the (external) vendor login flow
pub const SESSION_KEY_TENANT_ID: &str = "tenant_id";
pub const SESSION_KEY_ACTOR: &str = "actor";

/// Creates a session layer for Axum
pub async fn create_session_layer(
    pool: PgPool,
) -> Result<SessionManagerLayer<PostgresStore>, sqlx::Error> {
    // Create the session store backed by PostgreSQL
    let session_store = PostgresStore::new(pool);
    session_store.migrate().await?;

    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(true)
        .with_same_site(tower_sessions::cookie::SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(8)));

    Ok(session_layer)
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub governance: Governance,
    /// Cancelled on shutdown; long-running requests take a child token.
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Governance {
    fn from_ref(state: &AppState) -> Governance {
        state.governance.clone()
    }
}
