use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::entity::{DataType, UnknownVariant};
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Active,
    Superseded,
    Disabled,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Superseded => "superseded",
            PolicyStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PolicyStatus::Active),
            "superseded" => Ok(PolicyStatus::Superseded),
            "disabled" => Ok(PolicyStatus::Disabled),
            other => Err(UnknownVariant {
                kind: "policy status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for PolicyStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RetentionPolicy {
    pub id: Uuid,
    pub tenant_id: TenantId,
    #[sqlx(try_from = "String")]
    pub data_type: DataType,
    pub retention_days: i32,
    pub auto_delete: bool,
    #[sqlx(try_from = "String")]
    pub status: PolicyStatus,
    pub version: i32, // starts at 1, bumped by every update
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Requested settings for a new policy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDraft {
    pub data_type: DataType,
    pub retention_days: i32,
    pub auto_delete: bool,
}

impl RetentionPolicy {
    /// Rows recorded strictly before this instant are past retention.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }

    /// Inserts version 1. The partial unique index on active policies turns
    /// a concurrent duplicate into a unique violation.
    pub async fn insert(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        draft: PolicyDraft,
        version: i32,
    ) -> Result<Self, sqlx::Error> {
        let policy = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO retention_policies (tenant_id, data_type, retention_days, auto_delete, status, version)
            VALUES ($1, $2, $3, $4, 'active', $5)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(draft.data_type.as_str())
        .bind(draft.retention_days)
        .bind(draft.auto_delete)
        .bind(version)
        .fetch_one(&mut *conn)
        .await?;

        Ok(policy)
    }

    /// Finds the active policy for a data type
    pub async fn find_active(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        data_type: DataType,
    ) -> Result<Option<Self>, sqlx::Error> {
        let policy = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM retention_policies
            WHERE tenant_id = $1 AND data_type = $2 AND status = 'active'
            "#,
        )
        .bind(tenant_id)
        .bind(data_type.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(policy)
    }

    /// Lists every active policy of the tenant
    pub async fn list_active(
        conn: &mut PgConnection,
        tenant_id: TenantId,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let policies = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM retention_policies
            WHERE tenant_id = $1 AND status = 'active'
            ORDER BY data_type ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(policies)
    }

    /// Retires the active version with the given status
    pub async fn retire(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        data_type: DataType,
        status: PolicyStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        let policy = sqlx::query_as::<_, Self>(
            r#"
            UPDATE retention_policies
            SET status = $3, retired_at = NOW()
            WHERE tenant_id = $1 AND data_type = $2 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(data_type.as_str())
        .bind(status.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(policy)
    }
}
