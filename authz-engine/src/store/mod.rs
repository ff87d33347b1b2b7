//! Store collaborator interface.
//!
//! The engine only needs keyed reads, filtered reads, and a transaction that
//! can carry both a mutation and its audit entry to one atomic commit.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{render_filter, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AuditEntry, AuditLink, Operation, ResourceDescriptor, RowFilter};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Caller-side problems, as opposed to the store being down.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidIdentifier(_)
                | StoreError::InvalidMutation(_)
                | StoreError::Conflict(_)
        )
    }
}

/// A write against one resource row.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert { payload: Value },
    /// Shallow merge of `changes` into the stored row.
    Update { id: String, changes: Value },
    Delete { id: String },
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Insert { .. } => Operation::Insert,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }

    /// Id of an existing row this mutation targets. `None` for inserts.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Mutation::Insert { .. } => None,
            Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
        }
    }
}

/// Proof of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitToken {
    pub transaction_id: Uuid,
    pub committed_utc: DateTime<Utc>,
}

impl CommitToken {
    pub fn new() -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            committed_utc: Utc::now(),
        }
    }
}

impl Default for CommitToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one row by id.
    async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Fetch every row matching `filter` (all rows when `None`).
    async fn query(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Value>, StoreError>;

    /// At most `limit` rows matching `filter`, in id order. Adapters push the
    /// limit into the query; the fallback trims a full `query`.
    async fn query_limited(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let mut rows = self.query(descriptor, filter).await?;
        rows.truncate(limit);
        Ok(rows)
    }

    /// Audit entries of one resource, oldest first.
    async fn audit_entries(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError>;

    /// Open a transaction. Dropping it without `commit` discards every write.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Fetch one row by id, locking it until the transaction ends.
    async fn get(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Apply a mutation. Returns the row as stored after the write (the
    /// removed row for deletes), or `None` when the target does not exist.
    async fn mutate(
        &mut self,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<Option<Value>, StoreError>;

    /// Latest link of a resource's audit chain.
    async fn last_audit_link(
        &mut self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<AuditLink>, StoreError>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<CommitToken, StoreError>;
}

/// Shallow-merge `changes` into `row`, the way an UPDATE sets only the
/// columns it names.
pub fn apply_changes(row: &Value, changes: &Value) -> Result<Value, StoreError> {
    let (Value::Object(current), Value::Object(changes)) = (row, changes) else {
        return Err(StoreError::InvalidMutation(
            "update changes must be a JSON object".to_string(),
        ));
    };
    let mut merged = current.clone();
    for (column, value) in changes {
        merged.insert(column.clone(), value.clone());
    }
    Ok(Value::Object(merged))
}
