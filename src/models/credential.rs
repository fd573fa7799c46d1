use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::tenant::TenantId;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: String, // e.g. "square"
    #[serde(skip_serializing)]
    pub encrypted_access_token: Vec<u8>, // nonce || AES-256-GCM ciphertext
    #[serde(skip_serializing)]
    pub encrypted_refresh_token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub merchant_id: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plaintext token pair as received when a tenant links a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    pub provider: String,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub merchant_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A credential whose tokens have already been encrypted.
#[derive(Debug, Clone)]
pub struct SealedCredential {
    pub provider: String,
    pub encrypted_access_token: Vec<u8>,
    pub encrypted_refresh_token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub merchant_id: String,
    pub scopes: Vec<String>,
}

/// Encrypted token pair produced by a refresh.
#[derive(Debug, Clone)]
pub struct SealedTokens {
    pub encrypted_access_token: Vec<u8>,
    pub encrypted_refresh_token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// Persisted lifecycle state. `refreshing` is transient and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Active,
    ExpiringSoon,
    Expired,
    Revoked,
}

impl Credential {
    pub fn state(&self, now: DateTime<Utc>, margin: Duration) -> CredentialState {
        if !self.is_active {
            CredentialState::Revoked
        } else if self.expires_at <= now {
            CredentialState::Expired
        } else if self.expires_at <= now + margin {
            CredentialState::ExpiringSoon
        } else {
            CredentialState::Active
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        matches!(
            self.state(now, margin),
            CredentialState::ExpiringSoon | CredentialState::Expired
        )
    }

    /// Creates or re-links the tenant's credential for a provider.
    ///
    /// The (tenant_id, provider) key is unique, so re-linking reactivates the
    /// existing row rather than creating a second active one.
    pub async fn upsert(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        sealed: SealedCredential,
    ) -> Result<Self, sqlx::Error> {
        let credential = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO pos_credentials (
                tenant_id, provider, encrypted_access_token, encrypted_refresh_token,
                expires_at, merchant_id, scopes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, provider) DO UPDATE
            SET
                encrypted_access_token = EXCLUDED.encrypted_access_token,
                encrypted_refresh_token = EXCLUDED.encrypted_refresh_token,
                expires_at = EXCLUDED.expires_at,
                merchant_id = EXCLUDED.merchant_id,
                scopes = EXCLUDED.scopes,
                is_active = TRUE,
                last_refresh_at = NULL,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(&sealed.provider)
        .bind(&sealed.encrypted_access_token)
        .bind(&sealed.encrypted_refresh_token)
        .bind(sealed.expires_at)
        .bind(&sealed.merchant_id)
        .bind(&sealed.scopes)
        .fetch_one(&mut *conn)
        .await?;

        Ok(credential)
    }

    /// Finds the tenant's credential for a provider, active or revoked
    pub async fn find_by_provider(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        provider: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        let credential = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM pos_credentials
            WHERE tenant_id = $1 AND provider = $2
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(credential)
    }

    /// Replaces the token pair after a successful refresh
    pub async fn update_tokens(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        provider: &str,
        tokens: SealedTokens,
    ) -> Result<Option<Self>, sqlx::Error> {
        let credential = sqlx::query_as::<_, Self>(
            r#"
            UPDATE pos_credentials
            SET
                encrypted_access_token = $3,
                encrypted_refresh_token = $4,
                expires_at = $5,
                last_refresh_at = NOW(),
                updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND is_active = TRUE
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .bind(&tokens.encrypted_access_token)
        .bind(&tokens.encrypted_refresh_token)
        .bind(tokens.expires_at)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(credential)
    }

    /// Soft-disables the credential (explicit disconnect)
    pub async fn deactivate(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        provider: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE pos_credentials
            SET is_active = FALSE, updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND is_active = TRUE
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
