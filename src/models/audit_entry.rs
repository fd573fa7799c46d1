use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::entity::UnknownVariant;
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    CredentialLinked,
    CredentialRefreshed,
    CredentialRevoked,
    PolicyCreated,
    PolicySuperseded,
    PolicyDisabled,
    RetentionDelete,
    DataAccess,
    TenantErasureStarted,
    TenantErased,
    /// Rows found and removed under a tenant that was already erased.
    TenantResiduePurged,
}

impl AuditAction {
    const ALL: [AuditAction; 14] = [
        AuditAction::Create,
        AuditAction::Update,
        AuditAction::Delete,
        AuditAction::CredentialLinked,
        AuditAction::CredentialRefreshed,
        AuditAction::CredentialRevoked,
        AuditAction::PolicyCreated,
        AuditAction::PolicySuperseded,
        AuditAction::PolicyDisabled,
        AuditAction::RetentionDelete,
        AuditAction::DataAccess,
        AuditAction::TenantErasureStarted,
        AuditAction::TenantErased,
        AuditAction::TenantResiduePurged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::CredentialLinked => "CREDENTIAL_LINKED",
            AuditAction::CredentialRefreshed => "CREDENTIAL_REFRESHED",
            AuditAction::CredentialRevoked => "CREDENTIAL_REVOKED",
            AuditAction::PolicyCreated => "POLICY_CREATED",
            AuditAction::PolicySuperseded => "POLICY_SUPERSEDED",
            AuditAction::PolicyDisabled => "POLICY_DISABLED",
            AuditAction::RetentionDelete => "RETENTION_DELETE",
            AuditAction::DataAccess => "DATA_ACCESS",
            AuditAction::TenantErasureStarted => "TENANT_ERASURE_STARTED",
            AuditAction::TenantErased => "TENANT_ERASED",
            AuditAction::TenantResiduePurged => "TENANT_RESIDUE_PURGED",
        }
    }

    /// Whether the chain of an erased tenant may still take this entry.
    pub fn allowed_after_erasure(&self) -> bool {
        matches!(
            self,
            AuditAction::TenantErased | AuditAction::TenantResiduePurged
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "audit action",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for AuditAction {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One link of a tenant's hash chain. Never updated once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub sequence_no: i64,
    pub actor: String,
    #[sqlx(try_from = "String")]
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub old_values: Option<JsonValue>,
    pub new_values: Option<JsonValue>,
    pub prev_hash: String,
    pub entry_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied part of an audit entry; the trail fills in the chain.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub old_values: Option<JsonValue>,
    pub new_values: Option<JsonValue>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            old_values: None,
            new_values: None,
        }
    }

    pub fn with_old_values(mut self, values: JsonValue) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_new_values(mut self, values: JsonValue) -> Self {
        self.new_values = Some(values);
        self
    }
}

/// Compliance record of someone reading a data subject's information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccessRecord {
    pub accessor_id: String,
    pub accessor_role: String,
    pub data_subject_id: String,
    pub data_type: String,
    pub access_method: String,
    pub access_purpose: String,
    pub legal_basis: String,
}

impl AuditLogEntry {
    /// Inserts a fully chained entry. A duplicate (tenant_id, sequence_no)
    /// surfaces as a unique violation so the caller can retry on the new tip.
    pub async fn insert(conn: &mut PgConnection, entry: &AuditLogEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, tenant_id, sequence_no, actor, action, resource_type, resource_id,
                old_values, new_values, prev_hash, entry_hash, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.sequence_no)
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.old_values)
        .bind(&entry.new_values)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(entry.timestamp)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Latest entry of the tenant's chain
    pub async fn find_tip(
        conn: &mut PgConnection,
        tenant_id: TenantId,
    ) -> Result<Option<Self>, sqlx::Error> {
        let entry = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM audit_log
            WHERE tenant_id = $1
            ORDER BY sequence_no DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(entry)
    }

    /// Whole chain in sequence order
    pub async fn list_chain(
        conn: &mut PgConnection,
        tenant_id: TenantId,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let entries = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM audit_log
            WHERE tenant_id = $1
            ORDER BY sequence_no ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(entries)
    }

    /// Entries of one action, optionally from a point in time
    pub async fn list_by_action(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        action: AuditAction,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let entries = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM audit_log
            WHERE tenant_id = $1
              AND action = $2
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
            ORDER BY sequence_no ASC
            "#,
        )
        .bind(tenant_id)
        .bind(action.as_str())
        .bind(since)
        .fetch_all(&mut *conn)
        .await?;

        Ok(entries)
    }
}
