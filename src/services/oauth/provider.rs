use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
};
use secrecy::{ExposeSecret, Secret, SecretString};

use super::{ProviderAdapter, ProviderError, TokenGrant};

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub auth_url: String,
    pub token_url: String,
}

/// Refresh-token grant against a standard OAuth 2.0 token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthProvider {
    name: String,
    client: BasicClient,
}

impl OAuthProvider {
    pub fn new(config: OAuthProviderConfig) -> Result<Self, url::ParseError> {
        let client = BasicClient::new(
            ClientId::new(config.client_id),
            Some(ClientSecret::new(config.client_secret.expose_secret().clone())),
            AuthUrl::new(config.auth_url)?,
            Some(TokenUrl::new(config.token_url)?),
        );

        Ok(Self {
            name: config.name,
            client,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh_token(
        &self,
        refresh_token: &SecretString,
    ) -> Result<TokenGrant, ProviderError> {
        let token_response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose_secret().clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => match response.error() {
                    BasicErrorResponseType::Extension(code)
                        if code == "temporarily_unavailable" || code == "server_error" =>
                    {
                        ProviderError::Transient(response.to_string())
                    }
                    _ => ProviderError::Rejected(response.to_string()),
                },
                RequestTokenError::Request(e) => ProviderError::Transient(e.to_string()),
                RequestTokenError::Parse(e, _) => ProviderError::Transient(e.to_string()),
                RequestTokenError::Other(e) => ProviderError::Transient(e),
            })?;

        let expires_in = token_response
            .expires_in()
            .unwrap_or(std::time::Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS));

        Ok(TokenGrant {
            access_token: Secret::new(token_response.access_token().secret().clone()),
            // Providers that do not rotate keep the old refresh token valid
            refresh_token: Secret::new(
                token_response
                    .refresh_token()
                    .map(|t| t.secret().clone())
                    .unwrap_or_else(|| refresh_token.expose_secret().clone()),
            ),
            expires_at: Utc::now() + Duration::seconds(expires_in.as_secs() as i64),
        })
    }
}
