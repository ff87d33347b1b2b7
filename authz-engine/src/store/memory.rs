//! In-memory store for tests and embedded use.
//!
//! Transactions are serialised: a transaction holds the store lock from
//! `begin` until it commits or is dropped, and writes go to a private copy
//! that only replaces the shared state on commit.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{apply_changes, CommitToken, Mutation, Store, StoreError, StoreTransaction};
use crate::models::{
    field_key, AuditEntry, AuditLink, KeyType, ResourceDescriptor, RowFilter,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, Value>>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn row(&self, resource_type: &str, id: &str) -> Option<&Value> {
        self.tables.get(resource_type).and_then(|t| t.get(id))
    }

    fn last_link(&self, resource_type: &str, resource_id: &str) -> Option<AuditLink> {
        self.audit
            .iter()
            .rev()
            .find(|e| e.resource_type == resource_type && e.resource_id == resource_id)
            .map(AuditEntry::link)
    }

    fn apply(
        &mut self,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<Option<Value>, StoreError> {
        let table = self
            .tables
            .entry(descriptor.resource_type.clone())
            .or_default();

        match mutation {
            Mutation::Insert { payload } => {
                let Value::Object(mut row) = payload.clone() else {
                    return Err(StoreError::InvalidMutation(
                        "insert payload must be a JSON object".to_string(),
                    ));
                };
                let id = match field_key(payload, &descriptor.id_field) {
                    Some(id) => id,
                    None => {
                        let id = generate_id(descriptor, table)?;
                        row.insert(descriptor.id_field.clone(), Value::String(id.clone()));
                        id
                    }
                };
                if table.contains_key(&id) {
                    return Err(StoreError::Conflict(format!(
                        "{} '{}' already exists",
                        descriptor.resource_type, id
                    )));
                }
                let row = Value::Object(row);
                table.insert(id, row.clone());
                Ok(Some(row))
            }
            Mutation::Update { id, changes } => {
                let Some(current) = table.get(id) else {
                    return Ok(None);
                };
                let updated = apply_changes(current, changes)?;
                table.insert(id.clone(), updated.clone());
                Ok(Some(updated))
            }
            Mutation::Delete { id } => Ok(table.remove(id)),
        }
    }
}

fn generate_id(
    descriptor: &ResourceDescriptor,
    table: &BTreeMap<String, Value>,
) -> Result<String, StoreError> {
    match descriptor.key_type {
        KeyType::Uuid => Ok(Uuid::new_v4().to_string()),
        KeyType::Bigint => {
            let next = table
                .keys()
                .filter_map(|k| k.parse::<i64>().ok())
                .max()
                .unwrap_or(0)
                + 1;
            Ok(next.to_string())
        }
        KeyType::Text => Err(StoreError::InvalidMutation(format!(
            "insert into {} requires '{}'",
            descriptor.resource_type, descriptor.id_field
        ))),
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    reject_audit: AtomicBool,
}

impl Faults {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fixture row directly, without authorization or audit.
    pub async fn seed(&self, descriptor: &ResourceDescriptor, row: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply(descriptor, &Mutation::Insert { payload: row })?;
        Ok(())
    }

    /// Remove a row out of band, as another system would.
    pub async fn remove(&self, descriptor: &ResourceDescriptor, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(table) = state.tables.get_mut(&descriptor.resource_type) {
            table.remove(id);
        }
    }

    pub async fn row_count(&self, resource_type: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(resource_type).map_or(0, BTreeMap::len)
    }

    /// Every audit entry in append order.
    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make audit appends fail, to exercise rollback of the paired mutation.
    pub fn set_reject_audit(&self, reject: bool) {
        self.faults.reject_audit.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.faults.check()?;
        let state = self.state.lock().await;
        Ok(state.row(&descriptor.resource_type, id).cloned())
    }

    async fn query(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        self.query_limited(descriptor, filter, usize::MAX).await
    }

    async fn query_limited(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        self.faults.check()?;
        let state = self.state.lock().await;
        let Some(table) = state.tables.get(&descriptor.resource_type) else {
            return Ok(Vec::new());
        };
        let lookup = |parent_type: &str, id: &str| state.row(parent_type, id).cloned();
        Ok(table
            .values()
            .filter(|row| filter.is_none_or(|f| f.matches(row, &lookup)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn audit_entries(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.faults.check()?;
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.resource_type == resource_type && e.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.faults.check()?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.faults.check()?;
        Ok(self.working.row(&descriptor.resource_type, id).cloned())
    }

    async fn mutate(
        &mut self,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<Option<Value>, StoreError> {
        self.faults.check()?;
        self.working.apply(descriptor, mutation)
    }

    async fn last_audit_link(
        &mut self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<AuditLink>, StoreError> {
        self.faults.check()?;
        Ok(self.working.last_link(resource_type, resource_id))
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.faults.check()?;
        if self.faults.reject_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit append rejected".to_string()));
        }
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitToken, StoreError> {
        self.faults.check()?;
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(CommitToken::new())
    }
}
