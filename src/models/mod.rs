// Models module - Database entity representations

pub mod audit_entry;
pub mod credential;
pub mod entity;
pub mod retention_policy;
pub mod tenant;
pub mod tenant_data;

pub use audit_entry::{AuditAction, AuditEvent, AuditLogEntry, DataAccessRecord};
pub use credential::{Credential, CredentialState, NewCredential, SealedCredential, SealedTokens};
pub use entity::{DataType, EntityKind};
pub use retention_policy::{PolicyDraft, PolicyStatus, RetentionPolicy};
pub use tenant::TenantRecord;
pub use tenant_data::DeletionResult;
