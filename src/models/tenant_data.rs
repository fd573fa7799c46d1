// Row counting and removal over the tenant-scoped tables.
//
// Table and column names come from the closed EntityKind/DataType sets,
// never from input, so formatting them into SQL is safe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};

use super::entity::{DataType, EntityKind};
use crate::tenant::TenantId;

/// Record of one tenant erasure run. A tenant purged again after late rows
/// has several; the latest is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DeletionResult {
    pub tenant_id: TenantId,
    #[sqlx(json)]
    pub per_entity_counts: BTreeMap<EntityKind, u64>,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeletionResult {
    pub fn total_deleted(&self) -> u64 {
        self.per_entity_counts.values().sum()
    }

    pub async fn insert(conn: &mut PgConnection, result: &DeletionResult) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO deletion_results (tenant_id, per_entity_counts, verified, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(result.tenant_id)
        .bind(sqlx::types::Json(&result.per_entity_counts))
        .bind(result.verified)
        .bind(result.timestamp)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn find(
        conn: &mut PgConnection,
        tenant_id: TenantId,
    ) -> Result<Option<Self>, sqlx::Error> {
        let result = sqlx::query_as::<_, Self>(
            r#"
            SELECT tenant_id, per_entity_counts, verified, timestamp
            FROM deletion_results
            WHERE tenant_id = $1
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(result)
    }
}

pub async fn count_rows(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    kind: EntityKind,
) -> Result<u64, sqlx::Error> {
    let query = format!("SELECT COUNT(*) FROM {} WHERE tenant_id = $1", kind.table());
    let count: i64 = sqlx::query_scalar(&query)
        .bind(tenant_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(count.max(0) as u64)
}

pub async fn count_rows_before(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    data_type: DataType,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let query = format!(
        "SELECT COUNT(*) FROM {} WHERE tenant_id = $1 AND {} < $2",
        data_type.entity().table(),
        data_type.timestamp_column()
    );
    let count: i64 = sqlx::query_scalar(&query)
        .bind(tenant_id)
        .bind(cutoff)
        .fetch_one(&mut *conn)
        .await?;

    Ok(count.max(0) as u64)
}

/// Deletes expired rows of one data type. Dependent rows go with them
/// through the ON DELETE CASCADE foreign keys.
pub async fn delete_rows_before(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    data_type: DataType,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let query = format!(
        "DELETE FROM {} WHERE tenant_id = $1 AND {} < $2",
        data_type.entity().table(),
        data_type.timestamp_column()
    );
    let result = sqlx::query(&query)
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_all(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    kind: EntityKind,
) -> Result<u64, sqlx::Error> {
    let query = format!("DELETE FROM {} WHERE tenant_id = $1", kind.table());
    let result = sqlx::query(&query)
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

/// Rows left under the tenant in every tenant-scoped table, non-zero only.
pub async fn residue(
    conn: &mut PgConnection,
    tenant_id: TenantId,
) -> Result<BTreeMap<EntityKind, u64>, sqlx::Error> {
    let mut residue = BTreeMap::new();
    for kind in EntityKind::ERASURE_ORDER {
        let remaining = count_rows(conn, tenant_id, kind).await?;
        if remaining > 0 {
            residue.insert(kind, remaining);
        }
    }

    Ok(residue)
}
