use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    AuditStore, CredentialStore, ErasureStore, GovernanceStore, PurgeOutcome, RetentionStore,
    StoreError, StoreResult, TenantRegistry, SQLSTATE_NO_TENANT, SQLSTATE_TENANT_ERASED,
};

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Current time at the precision Postgres `TIMESTAMPTZ` stores.
///
/// Anything that is hashed and persisted must be stamped with this, or the
/// value read back would no longer hash the same.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
