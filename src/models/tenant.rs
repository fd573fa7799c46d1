use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::tenant::TenantId;

/// Control-plane registry entry. Holds no vendor data, so it is not
/// row-secured and outlives erasure (with `erased_at` set).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantRecord {
    pub id: TenantId,
    pub created_at: DateTime<Utc>,
    pub erased_at: Option<DateTime<Utc>>,
}

impl TenantRecord {
    /// Registers a tenant if it is not known yet
    pub async fn register(pool: &PgPool, id: TenantId) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id) VALUES ($1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find(pool: &PgPool, id: TenantId) -> Result<Option<Self>, sqlx::Error> {
        let tenant = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM tenants WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(tenant)
    }

    /// Lists tenants that have not been erased
    pub async fn list_active(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let tenants = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM tenants
            WHERE erased_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(tenants)
    }

    pub async fn mark_erased(conn: &mut PgConnection, id: TenantId) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE tenants SET erased_at = COALESCE(erased_at, NOW()) WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}
