// Services module - Governance core

pub mod audit;
pub mod deletion;
pub mod encryption;
pub mod oauth;
pub mod retention;
pub mod vault;

use std::sync::Arc;

use chrono::Duration;

use crate::db::GovernanceStore;
use crate::tenant::TenantGate;

use self::audit::AuditTrail;
use self::deletion::DeletionOrchestrator;
use self::encryption::TokenCipher;
use self::oauth::ProviderAdapter;
use self::retention::RetentionEngine;
use self::vault::CredentialVault;

/// Settings fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct GovernanceSettings {
    pub refresh_margin: Duration,
    pub retention_default_days: i32,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::minutes(5),
            retention_default_days: 365,
        }
    }
}

/// The governance components wired to one store and one tenant gate.
#[derive(Clone)]
pub struct Governance {
    pub store: Arc<dyn GovernanceStore>,
    pub audit: Arc<AuditTrail>,
    pub vault: Arc<CredentialVault>,
    pub retention: Arc<RetentionEngine>,
    pub deletion: Arc<DeletionOrchestrator>,
}

impl Governance {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        cipher: TokenCipher,
        providers: Vec<Arc<dyn ProviderAdapter>>,
        settings: GovernanceSettings,
    ) -> Self {
        let gate = Arc::new(TenantGate::new());
        let audit = Arc::new(AuditTrail::new(store.clone(), gate.clone()));

        let vault = providers.into_iter().fold(
            CredentialVault::new(
                store.clone(),
                Arc::new(cipher),
                audit.clone(),
                gate.clone(),
                settings.refresh_margin,
            ),
            CredentialVault::with_provider,
        );

        Self {
            retention: Arc::new(RetentionEngine::new(
                store.clone(),
                audit.clone(),
                gate.clone(),
                settings.retention_default_days,
            )),
            deletion: Arc::new(DeletionOrchestrator::new(store.clone(), audit.clone(), gate)),
            vault: Arc::new(vault),
            audit,
            store,
        }
    }
}
