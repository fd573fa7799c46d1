//! Append-only, hash-chained audit log per tenant.
//!
//! Entry `n` stores the hash of entry `n - 1` and its own hash over
//! `prev_hash ‖ canonical JSON of its fields`. Verification is a fold over
//! the persisted rows in sequence order.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use ring::digest;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::db::{self, GovernanceStore, StoreError};
use crate::error::GovernanceError;
use crate::models::{AuditAction, AuditEvent, AuditLogEntry, DataAccessRecord};
use crate::tenant::{KeyedMutex, TenantContext, TenantGate, TenantId};

/// `prev_hash` of the first entry of every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Appends attempted before giving up on a contended chain tip.
const MAX_APPEND_ATTEMPTS: u32 = 5;

/// Outcome of walking a tenant's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: u64,
    /// Sequence number of the first entry that is missing or does not verify.
    pub first_broken_at: Option<i64>,
}

pub struct AuditTrail {
    store: Arc<dyn GovernanceStore>,
    gate: Arc<TenantGate>,
    chain_locks: KeyedMutex<TenantId>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn GovernanceStore>, gate: Arc<TenantGate>) -> Self {
        Self {
            store,
            gate,
            chain_locks: KeyedMutex::new(),
        }
    }

    /// Appends an entry for the bound tenant, recorded against its actor.
    ///
    /// Waits while the tenant is being erased and fails with
    /// `TenantErased` afterwards.
    pub async fn log_action(
        &self,
        ctx: &TenantContext,
        event: AuditEvent,
    ) -> Result<AuditLogEntry, GovernanceError> {
        let _gate = self.gate.shared(ctx.tenant_id()).await;
        self.append(ctx, event).await
    }

    /// Appends without taking the tenant gate. Only for callers that already
    /// hold it, shared or exclusive.
    #[tracing::instrument(skip(self, ctx, event), fields(tenant_id = %ctx.tenant_id(), action = %event.action))]
    pub(crate) async fn append(
        &self,
        ctx: &TenantContext,
        event: AuditEvent,
    ) -> Result<AuditLogEntry, GovernanceError> {
        // In-process writers queue here; other replicas are caught by the
        // unique (tenant_id, sequence_no) key below.
        let _chain = self.chain_locks.lock(ctx.tenant_id()).await;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let (sequence_no, prev_hash) = match self.store.audit_tip(ctx).await? {
                Some(tip) => {
                    ctx.authorize(tip.tenant_id)?;
                    (tip.sequence_no + 1, tip.entry_hash)
                }
                None => (0, GENESIS_HASH.to_string()),
            };

            let entry = chain_entry(ctx, sequence_no, prev_hash, &event, db::now());

            match self.store.append_audit_entry(ctx, &entry).await {
                Ok(()) => {
                    tracing::debug!(sequence_no, "Audit entry appended");
                    return Ok(entry);
                }
                Err(StoreError::Conflict(detail)) => {
                    tracing::warn!(attempt, sequence_no, detail = %detail, "Audit chain tip moved, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(10 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(GovernanceError::Storage(StoreError::Conflict(format!(
            "audit chain for tenant {} still contended after {} attempts",
            ctx.tenant_id(),
            MAX_APPEND_ATTEMPTS
        ))))
    }

    /// Records that someone read a data subject's information.
    pub async fn log_data_access(
        &self,
        ctx: &TenantContext,
        record: DataAccessRecord,
    ) -> Result<AuditLogEntry, GovernanceError> {
        let event = AuditEvent::new(
            AuditAction::DataAccess,
            record.data_type.clone(),
            record.data_subject_id.clone(),
        )
        .with_new_values(json!(record));

        self.log_action(ctx, event).await
    }

    pub async fn verify_chain(&self, ctx: &TenantContext) -> Result<bool, GovernanceError> {
        Ok(self.verify_report(ctx).await?.valid)
    }

    pub async fn verify_report(
        &self,
        ctx: &TenantContext,
    ) -> Result<ChainVerification, GovernanceError> {
        let entries = self.store.audit_chain(ctx).await?;
        for entry in &entries {
            ctx.authorize(entry.tenant_id)?;
        }
        Ok(verify_entries(&entries))
    }

    /// Like [`verify_report`](Self::verify_report) but a broken chain is an
    /// error that has already been logged for operators.
    pub async fn ensure_chain_intact(
        &self,
        ctx: &TenantContext,
    ) -> Result<ChainVerification, GovernanceError> {
        let report = self.verify_report(ctx).await?;
        match report.first_broken_at {
            Some(sequence_no) => {
                tracing::error!(
                    tenant_id = %ctx.tenant_id(),
                    sequence_no,
                    "Audit chain integrity check failed"
                );
                Err(GovernanceError::AuditChainIntegrity { sequence_no })
            }
            None => Ok(report),
        }
    }

    /// Data-access records for compliance export, oldest first.
    pub async fn data_access_export(
        &self,
        ctx: &TenantContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DataAccessRecord>, GovernanceError> {
        let entries = self
            .store
            .audit_entries_by_action(ctx, AuditAction::DataAccess, since)
            .await?;

        entries
            .into_iter()
            .filter_map(|entry| entry.new_values)
            .map(|values| {
                serde_json::from_value(values).map_err(|e| {
                    GovernanceError::Validation(format!("malformed data access record: {}", e))
                })
            })
            .collect()
    }

    pub async fn count_actions(
        &self,
        ctx: &TenantContext,
        action: AuditAction,
    ) -> Result<usize, GovernanceError> {
        Ok(self
            .store
            .audit_entries_by_action(ctx, action, None)
            .await?
            .len())
    }
}

fn chain_entry(
    ctx: &TenantContext,
    sequence_no: i64,
    prev_hash: String,
    event: &AuditEvent,
    timestamp: DateTime<Utc>,
) -> AuditLogEntry {
    let mut entry = AuditLogEntry {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id(),
        sequence_no,
        actor: ctx.actor().to_string(),
        action: event.action,
        resource_type: event.resource_type.clone(),
        resource_id: event.resource_id.clone(),
        old_values: event.old_values.clone(),
        new_values: event.new_values.clone(),
        prev_hash,
        entry_hash: String::new(),
        timestamp,
    };
    entry.entry_hash = compute_entry_hash(&entry);
    entry
}

/// Pure fold over a chain in sequence order.
pub fn verify_entries(entries: &[AuditLogEntry]) -> ChainVerification {
    let mut expected_sequence = 0i64;
    let mut prev_hash = GENESIS_HASH;
    let mut entries_checked = 0u64;

    for entry in entries {
        entries_checked += 1;

        // A gap means an entry was removed; report the first missing one.
        let broken_at = if entry.sequence_no != expected_sequence {
            Some(expected_sequence.min(entry.sequence_no))
        } else if entry.prev_hash != prev_hash || entry.entry_hash != compute_entry_hash(entry) {
            Some(entry.sequence_no)
        } else {
            None
        };

        if broken_at.is_some() {
            return ChainVerification {
                valid: false,
                entries_checked,
                first_broken_at: broken_at,
            };
        }

        prev_hash = &entry.entry_hash;
        expected_sequence += 1;
    }

    ChainVerification {
        valid: true,
        entries_checked,
        first_broken_at: None,
    }
}

pub fn compute_entry_hash(entry: &AuditLogEntry) -> String {
    let fields = json!({
        "tenant_id": entry.tenant_id,
        "sequence_no": entry.sequence_no,
        "actor": entry.actor,
        "action": entry.action.as_str(),
        "resource_type": entry.resource_type,
        "resource_id": entry.resource_id,
        "old_values": entry.old_values,
        "new_values": entry.new_values,
        "timestamp": entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
    });

    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(entry.prev_hash.as_bytes());
    ctx.update(canonical_json(&fields).as_bytes());
    hex::encode(ctx.finish().as_ref())
}

/// JSON with object keys sorted at every depth.
fn canonical_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", JsonValue::String(key.clone()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        JsonValue::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AuditStore, ErasureStore, MemoryStore};
    use futures::future::join_all;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<MemoryStore>, AuditTrail, TenantContext) {
        let store = Arc::new(MemoryStore::new());
        let trail = AuditTrail::new(store.clone(), Arc::new(TenantGate::new()));
        let ctx = TenantContext::bind(TenantId::generate(), "vendor@example.com");
        (store, trail, ctx)
    }

    #[tokio::test]
    async fn test_chain_starts_at_genesis() {
        let (_, trail, ctx) = setup();

        let first = trail
            .log_action(&ctx, AuditEvent::new(AuditAction::Create, "product", "p1"))
            .await
            .unwrap();
        let second = trail
            .log_action(&ctx, AuditEvent::new(AuditAction::Update, "product", "p1"))
            .await
            .unwrap();

        assert_eq!(first.sequence_no, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(first.actor, "vendor@example.com");
        assert_eq!(second.sequence_no, 1);
        assert_eq!(second.prev_hash, first.entry_hash);
    }

    #[tokio::test]
    async fn test_flipped_hash_byte_breaks_chain() {
        let (store, trail, ctx) = setup();
        trail
            .log_action(&ctx, AuditEvent::new(AuditAction::Create, "product", "p1"))
            .await
            .unwrap();
        trail
            .log_action(&ctx, AuditEvent::new(AuditAction::Update, "product", "p1"))
            .await
            .unwrap();
        assert!(trail.verify_chain(&ctx).await.unwrap());

        store.tamper_audit_entry(ctx.tenant_id(), 1, |entry| {
            let mut bytes = entry.entry_hash.clone().into_bytes();
            bytes[0] = if bytes[0] == b'a' { b'b' } else { b'a' };
            entry.entry_hash = String::from_utf8(bytes).unwrap();
        });

        assert!(!trail.verify_chain(&ctx).await.unwrap());
        let report = trail.verify_report(&ctx).await.unwrap();
        assert_eq!(report.first_broken_at, Some(1));
    }

    #[tokio::test]
    async fn test_altered_field_breaks_chain() {
        let (store, trail, ctx) = setup();
        trail
            .log_action(
                &ctx,
                AuditEvent::new(AuditAction::Update, "product", "p1")
                    .with_new_values(json!({ "price_cents": 500 })),
            )
            .await
            .unwrap();

        store.tamper_audit_entry(ctx.tenant_id(), 0, |entry| {
            entry.new_values = Some(json!({ "price_cents": 5 }));
        });

        let err = trail.ensure_chain_intact(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::AuditChainIntegrity { sequence_no: 0 }
        ));
    }

    #[tokio::test]
    async fn test_removed_entry_is_a_gap() {
        let (store, trail, ctx) = setup();
        for resource in ["p1", "p2", "p3"] {
            trail
                .log_action(&ctx, AuditEvent::new(AuditAction::Create, "product", resource))
                .await
                .unwrap();
        }

        store.remove_audit_entry(ctx.tenant_id(), 1);

        let report = trail.verify_report(&ctx).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_broken_at, Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_fork() {
        let (_, trail, ctx) = setup();
        let trail = Arc::new(trail);

        let writes = (0..20).map(|i| {
            let trail = trail.clone();
            let ctx = ctx.clone();
            async move {
                trail
                    .log_action(
                        &ctx,
                        AuditEvent::new(AuditAction::Create, "product", format!("p{}", i)),
                    )
                    .await
            }
        });
        let results = join_all(writes).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let report = trail.verify_report(&ctx).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 20);
    }

    #[tokio::test]
    async fn test_tenants_have_independent_chains() {
        let (_, trail, a) = setup();
        let b = TenantContext::bind(TenantId::generate(), "other@example.com");

        trail
            .log_action(&a, AuditEvent::new(AuditAction::Create, "product", "p1"))
            .await
            .unwrap();
        let first_b = trail
            .log_action(&b, AuditEvent::new(AuditAction::Create, "product", "p1"))
            .await
            .unwrap();

        assert_eq!(first_b.sequence_no, 0);
        assert_eq!(trail.count_actions(&b, AuditAction::Create).await.unwrap(), 1);
        assert!(trail.verify_chain(&a).await.unwrap());
        assert!(trail.verify_chain(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_data_access_export_round_trips_records() {
        let (_, trail, ctx) = setup();
        let record = DataAccessRecord {
            accessor_id: "staff-7".into(),
            accessor_role: "support".into(),
            data_subject_id: "customer-42".into(),
            data_type: "sales".into(),
            access_method: "dashboard".into(),
            access_purpose: "refund".into(),
            legal_basis: "contract".into(),
        };

        trail.log_data_access(&ctx, record.clone()).await.unwrap();
        trail
            .log_action(&ctx, AuditEvent::new(AuditAction::Create, "product", "p1"))
            .await
            .unwrap();

        let exported = trail.data_access_export(&ctx, None).await.unwrap();
        assert_eq!(exported, vec![record]);
        assert!(trail.verify_chain(&ctx).await.unwrap());
    }

    fn access_record() -> DataAccessRecord {
        DataAccessRecord {
            accessor_id: "staff-7".into(),
            accessor_role: "support".into(),
            data_subject_id: "customer-42".into(),
            data_type: "sales".into(),
            access_method: "dashboard".into(),
            access_purpose: "refund".into(),
            legal_basis: "contract".into(),
        }
    }

    #[tokio::test]
    async fn test_data_access_waits_for_running_erasure() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(TenantGate::new());
        let trail = Arc::new(AuditTrail::new(store.clone(), gate.clone()));
        let ctx = TenantContext::bind(TenantId::generate(), "vendor@example.com");

        let erasing = gate.exclusive(ctx.tenant_id()).await;
        let pending = {
            let trail = trail.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { trail.log_data_access(&ctx, access_record()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert!(store.audit_chain(&ctx).await.unwrap().is_empty());

        drop(erasing);
        let entry = pending.await.unwrap().unwrap();
        assert_eq!(entry.sequence_no, 0);
    }

    #[tokio::test]
    async fn test_erased_tenant_cannot_log() {
        let (store, trail, ctx) = setup();
        store
            .purge_tenant(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        let err = trail
            .log_data_access(&ctx, access_record())
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::TenantErased(_)));
        assert!(store.audit_chain(&ctx).await.unwrap().is_empty());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({ "b": { "z": 1, "a": [ { "y": 2, "x": 1 } ] }, "a": null });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let report = verify_entries(&[]);
        assert!(report.valid);
        assert_eq!(report.entries_checked, 0);
    }
}
