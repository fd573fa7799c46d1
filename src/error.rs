use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;
use crate::models::{DataType, EntityKind};
use crate::services::encryption::EncryptionError;
use crate::services::oauth::ProviderError;
use crate::services::retention::EnforcementReport;

/// Failures of the governance core (vault, audit trail, retention, erasure).
#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Tenant isolation violation: {0}")]
    TenantIsolationViolation(String),

    #[error("Credential could not be decrypted: {0}")]
    Decryption(#[from] EncryptionError),

    #[error("Credential for {provider} expired and could not be refreshed; re-link required")]
    CredentialExpired {
        provider: String,
        #[source]
        source: Option<ProviderError>,
    },

    #[error("Provider refresh failed: {0}")]
    ProviderRefresh(#[from] ProviderError),

    #[error("No credential linked for provider {0}")]
    CredentialNotFound(String),

    #[error("Audit chain broken for tenant at sequence {sequence_no}")]
    AuditChainIntegrity { sequence_no: i64 },

    #[error("An active {data_type} retention policy already exists (version {version})")]
    RetentionPolicyConflict { data_type: DataType, version: i32 },

    #[error("No active {0} retention policy")]
    PolicyNotFound(DataType),

    #[error("Erasure left rows behind: {residue:?}")]
    DeletionVerificationFailure { residue: BTreeMap<EntityKind, u64> },

    #[error("Retention enforcement cancelled after {} data types", .completed.len())]
    EnforcementCancelled { completed: EnforcementReport },

    #[error("Tenant erasure cancelled before commit; nothing was removed")]
    ErasureCancelled,

    #[error("Tenant has been erased: {0}")]
    TenantErased(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl GovernanceError {
    /// Builds an isolation violation and logs it; these must always reach an
    /// operator, whatever the caller does with the error.
    pub fn isolation(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(detail = %detail, "Tenant isolation violation");
        GovernanceError::TenantIsolationViolation(detail)
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GovernanceError::ProviderRefresh(e) => e.is_transient(),
            GovernanceError::CredentialExpired {
                source: Some(e), ..
            } => e.is_transient(),
            GovernanceError::DeletionVerificationFailure { .. }
            | GovernanceError::EnforcementCancelled { .. }
            | GovernanceError::ErasureCancelled => true,
            _ => false,
        }
    }
}

impl From<StoreError> for GovernanceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Isolation(detail) => GovernanceError::isolation(detail),
            StoreError::TenantErased(detail) => GovernanceError::TenantErased(detail),
            other => GovernanceError::Storage(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Governance(#[from] GovernanceError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::Governance(e) => {
                let status = match e {
                    GovernanceError::TenantIsolationViolation(_) => StatusCode::FORBIDDEN,
                    GovernanceError::CredentialExpired { .. } => StatusCode::UNAUTHORIZED,
                    GovernanceError::ProviderRefresh(_) => StatusCode::SERVICE_UNAVAILABLE,
                    GovernanceError::CredentialNotFound(_) | GovernanceError::PolicyNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    GovernanceError::RetentionPolicyConflict { .. } => StatusCode::CONFLICT,
                    GovernanceError::TenantErased(_) => StatusCode::GONE,
                    GovernanceError::Validation(_) => StatusCode::BAD_REQUEST,
                    GovernanceError::EnforcementCancelled { .. }
                    | GovernanceError::ErasureCancelled => StatusCode::SERVICE_UNAVAILABLE,
                    GovernanceError::Decryption(_)
                    | GovernanceError::AuditChainIntegrity { .. }
                    | GovernanceError::DeletionVerificationFailure { .. }
                    | GovernanceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Storage details stay in the logs.
                let message = match e {
                    GovernanceError::Storage(_) => "Storage error".to_string(),
                    other => other.to_string(),
                };
                (status, message)
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }

        let mut body = json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": message,
            "retryable": matches!(&self, AppError::Governance(e) if e.is_retryable()),
        });
        if let AppError::Governance(GovernanceError::DeletionVerificationFailure { residue }) = &self
        {
            body["residue"] = json!(residue);
        }
        if let AppError::Governance(GovernanceError::EnforcementCancelled { completed }) = &self {
            body["completed"] = json!(completed);
        }

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_maps_to_forbidden() {
        let err = AppError::from(GovernanceError::isolation("cross-tenant read"));
        assert_eq!(err.status_and_message().0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_store_isolation_becomes_governance_isolation() {
        let err = GovernanceError::from(StoreError::Isolation("no tenant bound".into()));
        assert!(matches!(err, GovernanceError::TenantIsolationViolation(_)));
    }

    #[test]
    fn test_erased_tenant_is_gone_for_good() {
        let err = GovernanceError::from(StoreError::TenantErased("tenant t1".into()));
        assert!(matches!(err, GovernanceError::TenantErased(_)));
        assert!(!err.is_retryable());
        assert_eq!(AppError::from(err).status_and_message().0, StatusCode::GONE);
    }

    #[test]
    fn test_conflict_and_residue_statuses() {
        let conflict = AppError::from(GovernanceError::RetentionPolicyConflict {
            data_type: DataType::Sales,
            version: 1,
        });
        assert_eq!(conflict.status_and_message().0, StatusCode::CONFLICT);

        let residue = GovernanceError::DeletionVerificationFailure {
            residue: BTreeMap::from([(EntityKind::Sales, 2)]),
        };
        assert!(residue.is_retryable());
        assert_eq!(
            AppError::from(residue).status_and_message().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transient_provider_failure_is_retryable() {
        let err = GovernanceError::ProviderRefresh(ProviderError::Transient("timeout".into()));
        assert!(err.is_retryable());

        let rejected = GovernanceError::CredentialExpired {
            provider: "square".into(),
            source: Some(ProviderError::Rejected("invalid_grant".into())),
        };
        assert!(!rejected.is_retryable());
        assert_eq!(
            AppError::from(rejected).status_and_message().0,
            StatusCode::UNAUTHORIZED
        );
    }
}
