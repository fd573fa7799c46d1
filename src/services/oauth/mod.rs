pub mod provider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

pub use provider::{OAuthProvider, OAuthProviderConfig};

#[derive(thiserror::Error, Debug, Clone)]
pub enum ProviderError {
    /// Network failure, timeout or provider outage. Retry later.
    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),

    /// The provider refused the refresh token; the tenant must re-link.
    #[error("Provider rejected the refresh: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Token pair issued by a refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Contract the vault calls to renew a tenant's tokens with an external POS.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider key credentials are stored under, e.g. "square".
    fn name(&self) -> &str;

    async fn refresh_token(&self, refresh_token: &SecretString)
        -> Result<TokenGrant, ProviderError>;
}
