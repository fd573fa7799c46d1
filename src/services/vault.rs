use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::Serialize;
use serde_json::json;

use crate::db::GovernanceStore;
use crate::error::GovernanceError;
use crate::models::{
    AuditAction, AuditEvent, Credential, CredentialState, NewCredential, SealedCredential,
    SealedTokens,
};
use crate::services::audit::AuditTrail;
use crate::services::encryption::TokenCipher;
use crate::services::oauth::{ProviderAdapter, ProviderError, TokenGrant};
use crate::tenant::{KeyedMutex, TenantContext, TenantGate, TenantId};

/// What a caller may learn about a linked credential. Never token material.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub provider: String,
    pub state: CredentialState,
    pub merchant_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// Associated data a token is sealed under: the owning tenant, provider and
/// column. A ciphertext copied to any other row fails to open.
fn token_binding(tenant_id: TenantId, provider: &str, kind: TokenKind) -> Vec<u8> {
    format!("vendorvault:{}:{}:{}", tenant_id, provider, kind.as_str()).into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Refresh only if still due once the lock is held; fall back to the
    /// current token while it has not actually expired.
    IfDue,
    /// Always call the provider and surface its errors.
    Forced,
}

type RefreshKey = (TenantId, String);

pub struct CredentialVault {
    store: Arc<dyn GovernanceStore>,
    cipher: Arc<TokenCipher>,
    audit: Arc<AuditTrail>,
    gate: Arc<TenantGate>,
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    refresh_margin: Duration,
    refresh_locks: KeyedMutex<RefreshKey>,
    /// Last failed provider call per credential, handed to callers that
    /// queued behind it.
    refresh_failures: Mutex<HashMap<RefreshKey, (Instant, ProviderError)>>,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        cipher: Arc<TokenCipher>,
        audit: Arc<AuditTrail>,
        gate: Arc<TenantGate>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            audit,
            gate,
            providers: HashMap::new(),
            refresh_margin,
            refresh_locks: KeyedMutex::new(),
            refresh_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Links (or re-links) the tenant's credential for a provider.
    #[tracing::instrument(skip(self, ctx, new), fields(tenant_id = %ctx.tenant_id(), provider = %new.provider))]
    pub async fn store_credential(
        &self,
        ctx: &TenantContext,
        new: NewCredential,
    ) -> Result<Credential, GovernanceError> {
        if new.provider.trim().is_empty() {
            return Err(GovernanceError::Validation("provider is required".to_string()));
        }

        let _gate = self.gate.shared(ctx.tenant_id()).await;
        let _refresh = self
            .refresh_locks
            .lock((ctx.tenant_id(), new.provider.clone()))
            .await;

        let sealed = SealedCredential {
            encrypted_access_token: self.seal(
                ctx,
                &new.provider,
                TokenKind::Access,
                new.access_token.expose_secret(),
            )?,
            encrypted_refresh_token: self.seal(
                ctx,
                &new.provider,
                TokenKind::Refresh,
                new.refresh_token.expose_secret(),
            )?,
            provider: new.provider,
            expires_at: new.expires_at,
            merchant_id: new.merchant_id,
            scopes: new.scopes,
        };

        self.store.register_tenant(ctx.tenant_id()).await?;
        let credential = self.store.upsert_credential(ctx, sealed).await?;
        ctx.authorize(credential.tenant_id)?;

        self.audit
            .append(
                ctx,
                AuditEvent::new(
                    AuditAction::CredentialLinked,
                    "credential",
                    credential.provider.clone(),
                )
                .with_new_values(json!({
                    "merchant_id": credential.merchant_id,
                    "scopes": credential.scopes,
                    "expires_at": credential.expires_at,
                })),
            )
            .await?;

        tracing::info!("Credential linked");
        Ok(credential)
    }

    /// Decrypted access token, refreshed first when it is inside the margin.
    ///
    /// Concurrent callers needing the same refresh wait on one provider call
    /// and reuse its result.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), provider = %provider))]
    pub async fn get_valid_access_token(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<SecretString, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;

        let credential = self.active_credential(ctx, provider).await?;
        if !credential.needs_refresh(Utc::now(), self.refresh_margin) {
            return self.open(&credential, TokenKind::Access);
        }

        self.refresh(ctx, provider, RefreshMode::IfDue).await
    }

    /// Forces a refresh. Provider failures are returned as-is so the caller
    /// can back off and retry.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), provider = %provider))]
    pub async fn refresh_now(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<SecretString, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;
        self.refresh(ctx, provider, RefreshMode::Forced).await
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), provider = %provider))]
    pub async fn revoke_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<(), GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;
        let _refresh = self
            .refresh_locks
            .lock((ctx.tenant_id(), provider.to_string()))
            .await;

        if !self.store.deactivate_credential(ctx, provider).await? {
            return Err(GovernanceError::CredentialNotFound(provider.to_string()));
        }

        self.audit
            .append(
                ctx,
                AuditEvent::new(AuditAction::CredentialRevoked, "credential", provider),
            )
            .await?;

        tracing::info!("Credential revoked");
        Ok(())
    }

    pub async fn credential_status(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<CredentialStatus, GovernanceError> {
        let credential = self
            .store
            .find_credential(ctx, provider)
            .await?
            .ok_or_else(|| GovernanceError::CredentialNotFound(provider.to_string()))?;
        ctx.authorize(credential.tenant_id)?;

        Ok(CredentialStatus {
            state: credential.state(Utc::now(), self.refresh_margin),
            provider: credential.provider,
            merchant_id: credential.merchant_id,
            scopes: credential.scopes,
            expires_at: credential.expires_at,
            last_refresh_at: credential.last_refresh_at,
        })
    }

    async fn active_credential(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<Credential, GovernanceError> {
        let credential = self
            .store
            .find_credential(ctx, provider)
            .await?
            .ok_or_else(|| GovernanceError::CredentialNotFound(provider.to_string()))?;
        ctx.authorize(credential.tenant_id)?;

        if !credential.is_active {
            return Err(GovernanceError::CredentialExpired {
                provider: provider.to_string(),
                source: None,
            });
        }
        Ok(credential)
    }

    fn seal(
        &self,
        ctx: &TenantContext,
        provider: &str,
        kind: TokenKind,
        token: &str,
    ) -> Result<Vec<u8>, GovernanceError> {
        let aad = token_binding(ctx.tenant_id(), provider, kind);
        Ok(self.cipher.encrypt(token, &aad)?)
    }

    fn open(
        &self,
        credential: &Credential,
        kind: TokenKind,
    ) -> Result<SecretString, GovernanceError> {
        let sealed = match kind {
            TokenKind::Access => &credential.encrypted_access_token,
            TokenKind::Refresh => &credential.encrypted_refresh_token,
        };
        let aad = token_binding(credential.tenant_id, &credential.provider, kind);
        Ok(Secret::new(self.cipher.decrypt(sealed, &aad)?))
    }

    /// A failure recorded by a provider call that started after `since`.
    fn failure_since(&self, key: &RefreshKey, since: Instant) -> Option<ProviderError> {
        let failures = self
            .refresh_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failures.get(key) {
            Some((failed_at, error)) if *failed_at >= since => Some(error.clone()),
            _ => None,
        }
    }

    fn record_outcome(&self, key: &RefreshKey, outcome: &Result<TokenGrant, ProviderError>) {
        let mut failures = self
            .refresh_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(_) => {
                failures.remove(key);
            }
            Err(e) => {
                failures.insert(key.clone(), (Instant::now(), e.clone()));
            }
        }
    }

    /// Caller holds the tenant gate.
    async fn refresh(
        &self,
        ctx: &TenantContext,
        provider: &str,
        mode: RefreshMode,
    ) -> Result<SecretString, GovernanceError> {
        let key = (ctx.tenant_id(), provider.to_string());
        let queued_at = Instant::now();
        let _refresh = self.refresh_locks.lock(key.clone()).await;

        // Whoever held the lock before us may already have refreshed.
        let credential = self.active_credential(ctx, provider).await?;
        let now = Utc::now();
        if mode == RefreshMode::IfDue && !credential.needs_refresh(now, self.refresh_margin) {
            tracing::debug!("Reusing token refreshed by a concurrent caller");
            return self.open(&credential, TokenKind::Access);
        }

        // Or tried and failed while we queued; don't hit the provider again.
        let outcome = match self.failure_since(&key, queued_at) {
            Some(e) => {
                tracing::debug!(error = %e, "Reusing refresh failure of a concurrent caller");
                Err(e)
            }
            None => {
                let refresh_token = self.open(&credential, TokenKind::Refresh)?;
                let outcome = match self.providers.get(provider) {
                    Some(adapter) => adapter.refresh_token(&refresh_token).await,
                    None => Err(ProviderError::Rejected(format!(
                        "no adapter registered for {}",
                        provider
                    ))),
                };
                self.record_outcome(&key, &outcome);
                outcome
            }
        };

        let grant = match (outcome, mode) {
            (Ok(grant), _) => grant,
            (Err(e), RefreshMode::Forced) => {
                tracing::warn!(error = %e, "Forced credential refresh failed");
                return Err(GovernanceError::ProviderRefresh(e));
            }
            (Err(e), RefreshMode::IfDue) if credential.expires_at > now => {
                tracing::warn!(
                    error = %e,
                    expires_at = %credential.expires_at,
                    "Credential refresh failed, current token still valid"
                );
                return self.open(&credential, TokenKind::Access);
            }
            (Err(e), RefreshMode::IfDue) => {
                tracing::warn!(error = %e, "Credential expired and refresh failed");
                return Err(GovernanceError::CredentialExpired {
                    provider: provider.to_string(),
                    source: Some(e),
                });
            }
        };

        let tokens = SealedTokens {
            encrypted_access_token: self.seal(
                ctx,
                provider,
                TokenKind::Access,
                grant.access_token.expose_secret(),
            )?,
            encrypted_refresh_token: self.seal(
                ctx,
                provider,
                TokenKind::Refresh,
                grant.refresh_token.expose_secret(),
            )?,
            expires_at: grant.expires_at,
        };
        let updated = self
            .store
            .update_credential_tokens(ctx, provider, tokens)
            .await?;
        ctx.authorize(updated.tenant_id)?;

        self.audit
            .append(
                ctx,
                AuditEvent::new(AuditAction::CredentialRefreshed, "credential", provider)
                    .with_old_values(json!({ "expires_at": credential.expires_at }))
                    .with_new_values(json!({ "expires_at": updated.expires_at })),
            )
            .await?;

        tracing::info!(expires_at = %updated.expires_at, "Credential refreshed");
        Ok(grant.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CredentialStore, MemoryStore};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        calls: AtomicUsize,
        failure: Option<fn() -> ProviderError>,
    }

    impl FakeProvider {
        fn working() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failure: None,
            })
        }

        fn failing(failure: fn() -> ProviderError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failure: Some(failure),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeProvider {
        fn name(&self) -> &str {
            "square"
        }

        async fn refresh_token(
            &self,
            refresh_token: &SecretString,
        ) -> Result<TokenGrant, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            Ok(TokenGrant {
                access_token: Secret::new(format!("a-refreshed-{}", call)),
                refresh_token: Secret::new(format!("{}-rotated", refresh_token.expose_secret())),
                expires_at: Utc::now() + Duration::hours(1),
            })
        }
    }

    struct Fixture {
        vault: Arc<CredentialVault>,
        audit: Arc<AuditTrail>,
        store: Arc<MemoryStore>,
    }

    fn fixture(provider: Arc<FakeProvider>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(TenantGate::new());
        let audit = Arc::new(AuditTrail::new(store.clone(), gate.clone()));
        let vault = CredentialVault::new(
            store.clone(),
            Arc::new(TokenCipher::from_root_secret("vault-test-secret").unwrap()),
            audit.clone(),
            gate,
            Duration::minutes(5),
        )
        .with_provider(provider);

        Fixture {
            vault: Arc::new(vault),
            audit,
            store,
        }
    }

    fn link(access: &str, refresh: &str, expires_in: Duration) -> NewCredential {
        NewCredential {
            provider: "square".to_string(),
            access_token: Secret::new(access.to_string()),
            refresh_token: Secret::new(refresh.to_string()),
            expires_at: Utc::now() + expires_in,
            merchant_id: "M-123".to_string(),
            scopes: vec!["ITEMS_READ".to_string()],
        }
    }

    fn tenant() -> TenantContext {
        TenantContext::bind(TenantId::generate(), "vendor@example.com")
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_provider_call() {
        let provider = FakeProvider::working();
        let f = fixture(provider.clone());
        let t1 = tenant();

        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::hours(1)))
            .await
            .unwrap();
        let token = f.vault.get_valid_access_token(&t1, "square").await.unwrap();

        assert_eq!(token.expose_secret(), "a1");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        let provider = FakeProvider::working();
        let f = fixture(provider.clone());
        let t1 = tenant();

        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(2)))
            .await
            .unwrap();
        let token = f.vault.get_valid_access_token(&t1, "square").await.unwrap();

        assert_ne!(token.expose_secret(), "a1");
        assert_eq!(provider.calls(), 1);

        let status = f.vault.credential_status(&t1, "square").await.unwrap();
        assert!(status.last_refresh_at.is_some());
        assert_eq!(status.state, CredentialState::Active);
        assert_eq!(
            f.audit
                .count_actions(&t1, AuditAction::CredentialRefreshed)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_tokens_are_never_stored_in_plaintext() {
        let f = fixture(FakeProvider::working());
        let t1 = tenant();

        f.vault
            .store_credential(&t1, link("a1-plain", "r1-plain", Duration::hours(1)))
            .await
            .unwrap();
        let stored = f.store.find_credential(&t1, "square").await.unwrap().unwrap();

        assert!(!stored
            .encrypted_access_token
            .windows(8)
            .any(|w| w == b"a1-plain"));
        assert!(!stored
            .encrypted_refresh_token
            .windows(8)
            .any(|w| w == b"r1-plain"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let provider = FakeProvider::working();
        let f = fixture(provider.clone());
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(1)))
            .await
            .unwrap();

        let calls = (0..10).map(|_| {
            let vault = f.vault.clone();
            let ctx = t1.clone();
            tokio::spawn(async move { vault.get_valid_access_token(&ctx, "square").await })
        });
        let tokens: Vec<String> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().expose_secret().clone())
            .collect();

        assert_eq!(provider.calls(), 1);
        assert!(tokens.iter().all(|t| t == "a-refreshed-1"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_of_expired_token_requires_relink() {
        let provider = FakeProvider::failing(|| ProviderError::Rejected("invalid_grant".into()));
        let f = fixture(provider);
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(-1)))
            .await
            .unwrap();

        let err = f
            .vault
            .get_valid_access_token(&t1, "square")
            .await
            .unwrap_err();

        assert!(matches!(err, GovernanceError::CredentialExpired { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_unexpired_token() {
        let provider = FakeProvider::failing(|| ProviderError::Transient("timeout".into()));
        let f = fixture(provider.clone());
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(2)))
            .await
            .unwrap();

        let token = f.vault.get_valid_access_token(&t1, "square").await.unwrap();
        assert_eq!(token.expose_secret(), "a1");

        let forced = f.vault.refresh_now(&t1, "square").await.unwrap_err();
        assert!(matches!(forced, GovernanceError::ProviderRefresh(_)));
        assert!(forced.is_retryable());
    }

    #[tokio::test]
    async fn test_callers_queued_behind_a_failed_refresh_share_its_error() {
        let provider = FakeProvider::failing(|| ProviderError::Transient("timeout".into()));
        let f = fixture(provider.clone());
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(-1)))
            .await
            .unwrap();

        let calls = (0..10).map(|_| {
            let vault = f.vault.clone();
            let ctx = t1.clone();
            tokio::spawn(async move { vault.get_valid_access_token(&ctx, "square").await })
        });
        for joined in join_all(calls).await {
            let err = joined.unwrap().unwrap_err();
            assert!(matches!(
                err,
                GovernanceError::CredentialExpired {
                    source: Some(ProviderError::Transient(_)),
                    ..
                }
            ));
            assert!(err.is_retryable());
        }
        assert_eq!(provider.calls(), 1);

        // A caller arriving after the failure tries the provider again.
        assert!(f.vault.get_valid_access_token(&t1, "square").await.is_err());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_ciphertext_moved_to_another_tenant_does_not_open() {
        let f = fixture(FakeProvider::working());
        let a = tenant();
        let b = tenant();
        let from_a = f
            .vault
            .store_credential(&a, link("a-secret", "r-secret", Duration::hours(1)))
            .await
            .unwrap();
        f.vault
            .store_credential(&b, link("b-secret", "rb-secret", Duration::hours(1)))
            .await
            .unwrap();

        f.store
            .upsert_credential(
                &b,
                SealedCredential {
                    provider: "square".into(),
                    encrypted_access_token: from_a.encrypted_access_token.clone(),
                    encrypted_refresh_token: from_a.encrypted_refresh_token.clone(),
                    expires_at: from_a.expires_at,
                    merchant_id: from_a.merchant_id.clone(),
                    scopes: from_a.scopes.clone(),
                },
            )
            .await
            .unwrap();

        let err = f.vault.get_valid_access_token(&b, "square").await.unwrap_err();
        assert!(matches!(err, GovernanceError::Decryption(_)));
        let token = f.vault.get_valid_access_token(&a, "square").await.unwrap();
        assert_eq!(token.expose_secret(), "a-secret");
    }

    #[tokio::test]
    async fn test_access_token_in_refresh_column_does_not_open() {
        let provider = FakeProvider::working();
        let f = fixture(provider.clone());
        let t1 = tenant();
        let credential = f
            .vault
            .store_credential(&t1, link("a1", "r1", Duration::minutes(1)))
            .await
            .unwrap();

        f.store
            .upsert_credential(
                &t1,
                SealedCredential {
                    provider: "square".into(),
                    encrypted_access_token: credential.encrypted_access_token.clone(),
                    encrypted_refresh_token: credential.encrypted_access_token,
                    expires_at: credential.expires_at,
                    merchant_id: credential.merchant_id,
                    scopes: credential.scopes,
                },
            )
            .await
            .unwrap();

        let err = f.vault.refresh_now(&t1, "square").await.unwrap_err();
        assert!(matches!(err, GovernanceError::Decryption(_)));
        assert_eq!(provider.calls(), 0);
    }

    /// Records the fields every new span is created with.
    #[derive(Clone, Default)]
    struct SpanRecorder(Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>);

    struct FieldValues(Vec<(String, String)>);

    impl tracing::field::Visit for FieldValues {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanRecorder {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut values = FieldValues(Vec::new());
            attrs.record(&mut values);
            self.0
                .lock()
                .unwrap()
                .push((attrs.metadata().name().to_string(), values.0));
        }
    }

    #[tokio::test]
    async fn test_spans_name_the_provider() {
        use tracing_subscriber::layer::SubscriberExt;

        let recorder = SpanRecorder::default();
        let _subscriber =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));

        let f = fixture(FakeProvider::working());
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::hours(1)))
            .await
            .unwrap();
        f.vault.get_valid_access_token(&t1, "square").await.unwrap();
        f.vault.refresh_now(&t1, "square").await.unwrap();
        f.vault.revoke_credential(&t1, "square").await.unwrap();

        let spans = recorder.0.lock().unwrap().clone();
        for name in ["get_valid_access_token", "refresh_now", "revoke_credential"] {
            let (_, fields) = spans
                .iter()
                .find(|(span, _)| span == name)
                .unwrap_or_else(|| panic!("no {} span", name));
            assert!(
                fields.contains(&("provider".to_string(), "square".to_string())),
                "{} span fields: {:?}",
                name,
                fields
            );
            assert!(fields.iter().any(|(field, _)| field == "tenant_id"));
        }
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_reach_credential() {
        let f = fixture(FakeProvider::working());
        let a = tenant();
        let b = tenant();
        f.vault
            .store_credential(&a, link("a1", "r1", Duration::hours(1)))
            .await
            .unwrap();

        let err = f.vault.get_valid_access_token(&b, "square").await.unwrap_err();
        assert!(matches!(err, GovernanceError::CredentialNotFound(_)));
    }

    #[tokio::test]
    async fn test_revoked_credential_is_unusable_until_relinked() {
        let f = fixture(FakeProvider::working());
        let t1 = tenant();
        f.vault
            .store_credential(&t1, link("a1", "r1", Duration::hours(1)))
            .await
            .unwrap();

        f.vault.revoke_credential(&t1, "square").await.unwrap();
        let status = f.vault.credential_status(&t1, "square").await.unwrap();
        assert_eq!(status.state, CredentialState::Revoked);
        assert!(matches!(
            f.vault.get_valid_access_token(&t1, "square").await,
            Err(GovernanceError::CredentialExpired { source: None, .. })
        ));

        f.vault
            .store_credential(&t1, link("a2", "r2", Duration::hours(1)))
            .await
            .unwrap();
        let token = f.vault.get_valid_access_token(&t1, "square").await.unwrap();
        assert_eq!(token.expose_secret(), "a2");
        assert!(f.audit.verify_chain(&t1).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_a_decryption_error() {
        let f = fixture(FakeProvider::working());
        let t1 = tenant();
        let credential = f
            .vault
            .store_credential(&t1, link("a1", "r1", Duration::hours(1)))
            .await
            .unwrap();

        let mut tampered = credential.encrypted_access_token.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        f.store
            .upsert_credential(
                &t1,
                SealedCredential {
                    provider: "square".into(),
                    encrypted_access_token: tampered,
                    encrypted_refresh_token: credential.encrypted_refresh_token,
                    expires_at: credential.expires_at,
                    merchant_id: credential.merchant_id,
                    scopes: credential.scopes,
                },
            )
            .await
            .unwrap();

        let err = f.vault.get_valid_access_token(&t1, "square").await.unwrap_err();
        assert!(matches!(err, GovernanceError::Decryption(_)));
    }
}
