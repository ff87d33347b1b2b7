//! Audit recording and chain verification.

use chrono::{SecondsFormat, SubsecRound, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{AuditEntry, Operation, Principal};
use crate::services::metrics::AUDIT_ENTRIES_TOTAL;
use crate::store::{StoreError, StoreTransaction};

/// One allowed mutation, as handed to the recorder.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub actor: &'a Principal,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub operation: Operation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub request_id: Option<&'a str>,
}

/// Appends hash-chained audit entries inside the caller's transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditRecorder;

impl AuditRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Append the next entry of the resource's chain. Nothing is visible
    /// until the transaction commits.
    pub async fn record(
        &self,
        tx: &mut dyn StoreTransaction,
        event: AuditEvent<'_>,
    ) -> Result<AuditEntry, StoreError> {
        let previous = tx
            .last_audit_link(event.resource_type, event.resource_id)
            .await?;

        let mut entry = AuditEntry {
            entry_id: Uuid::new_v4(),
            resource_type: event.resource_type.to_string(),
            resource_id: event.resource_id.to_string(),
            operation: event.operation,
            actor_id: event.actor.id().to_string(),
            actor_kind: event.actor.kind(),
            before_state: event.before,
            after_state: event.after,
            request_id: event.request_id.map(str::to_string),
            sequence: previous.as_ref().map_or(1, |link| link.sequence + 1),
            prev_hash: previous.map(|link| link.entry_hash),
            entry_hash: String::new(),
            // Postgres keeps microseconds; the hash must survive a round trip.
            created_utc: Utc::now().trunc_subsecs(6),
        };
        entry.entry_hash = compute_entry_hash(&entry);

        tx.append_audit(&entry).await?;

        AUDIT_ENTRIES_TOTAL
            .with_label_values(&[entry.operation.as_str()])
            .inc();

        info!(
            entry_id = %entry.entry_id,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            operation = %entry.operation,
            actor_id = %entry.actor_id,
            sequence = entry.sequence,
            request_id = entry.request_id.as_deref().unwrap_or(""),
            "Audit entry recorded"
        );

        Ok(entry)
    }
}

/// SHA-256 over the canonical JSON form of every field but `entry_hash`.
pub fn compute_entry_hash(entry: &AuditEntry) -> String {
    // serde_json maps are ordered by key, which makes this canonical.
    let canonical = json!({
        "entry_id": entry.entry_id,
        "sequence": entry.sequence,
        "resource_type": entry.resource_type,
        "resource_id": entry.resource_id,
        "operation": entry.operation.as_str(),
        "actor_id": entry.actor_id,
        "actor_kind": entry.actor_kind.as_str(),
        "before_state": entry.before_state,
        "after_state": entry.after_state,
        "request_id": entry.request_id,
        "prev_hash": entry.prev_hash,
        "created_utc": entry.created_utc.to_rfc3339_opts(SecondsFormat::Micros, true),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("Entry {found} found where sequence {expected} was expected")]
    SequenceGap { expected: i64, found: i64 },

    #[error("Entry {sequence} belongs to another resource")]
    ForeignEntry { sequence: i64 },

    #[error("Entry {sequence} does not link to its predecessor")]
    BrokenLink { sequence: i64 },

    #[error("Entry {sequence} was modified after it was recorded")]
    HashMismatch { sequence: i64 },
}

/// Check one resource's chain, oldest first.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };

    let mut prev_hash: Option<&str> = None;
    for (expected, entry) in (1_i64..).zip(entries) {
        if entry.sequence != expected {
            return Err(ChainError::SequenceGap {
                expected,
                found: entry.sequence,
            });
        }
        if entry.resource_type != first.resource_type || entry.resource_id != first.resource_id {
            return Err(ChainError::ForeignEntry {
                sequence: entry.sequence,
            });
        }
        if entry.prev_hash.as_deref() != prev_hash {
            return Err(ChainError::BrokenLink {
                sequence: entry.sequence,
            });
        }
        if compute_entry_hash(entry) != entry.entry_hash {
            return Err(ChainError::HashMismatch {
                sequence: entry.sequence,
            });
        }
        prev_hash = Some(&entry.entry_hash);
    }
    Ok(())
}
