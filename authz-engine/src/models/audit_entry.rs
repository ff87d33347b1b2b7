//! Audit entry model - immutable record of one allowed mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::decision::Operation;
use super::principal::PrincipalKind;

/// One link in a per-resource hash chain.
///
/// `entry_hash` covers every other field plus `prev_hash`, so editing or
/// removing an earlier entry breaks every later one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
    pub actor_id: String,
    pub actor_kind: PrincipalKind,
    /// Null for inserts.
    pub before_state: Option<Value>,
    /// Null for deletes.
    pub after_state: Option<Value>,
    pub request_id: Option<String>,
    /// 1-based position within the resource's chain.
    pub sequence: i64,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub created_utc: DateTime<Utc>,
}

impl AuditEntry {
    /// Tail of the chain this entry closes.
    pub fn link(&self) -> AuditLink {
        AuditLink {
            sequence: self.sequence,
            entry_hash: self.entry_hash.clone(),
        }
    }

    /// Latest known state of the resource according to this entry.
    pub fn last_known_state(&self) -> Option<&Value> {
        self.after_state.as_ref().or(self.before_state.as_ref())
    }
}

/// The most recent entry of a resource's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLink {
    pub sequence: i64,
    pub entry_hash: String,
}
