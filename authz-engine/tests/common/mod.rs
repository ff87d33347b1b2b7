//! Common test utilities for authz-engine integration tests.
#![allow(dead_code)]

use authz_engine::models::{KeyType, OwnershipTemplate, ResourceDescriptor};
use authz_engine::services::{
    DescriptorRegistry, IndexSpec, ProjectionAccessor, ProjectionAccessorConfig, RegistryBuilder,
};
use authz_engine::store::InMemoryStore;
use authz_engine::AuthzEngine;
use serde_json::{json, Value};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,authz_engine=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn conversation() -> ResourceDescriptor {
    ResourceDescriptor::direct_owner("conversation", "user_id")
        .facilitator_visible()
        .with_key_type(KeyType::Text)
}

pub fn journal() -> ResourceDescriptor {
    ResourceDescriptor::direct_owner("journal_entry", "user_id").with_key_type(KeyType::Text)
}

pub fn connection() -> ResourceDescriptor {
    ResourceDescriptor::new(
        "connection",
        OwnershipTemplate::MultiOwner {
            owner_fields: vec!["user_id".into(), "professional_id".into()],
        },
    )
    .with_key_type(KeyType::Text)
}

pub fn group_room() -> ResourceDescriptor {
    ResourceDescriptor::new(
        "group_room",
        OwnershipTemplate::ParticipantSet {
            members_field: "participant_ids".into(),
        },
    )
    .with_key_type(KeyType::Text)
}

pub fn session() -> ResourceDescriptor {
    ResourceDescriptor::direct_owner("session", "user_id").with_key_type(KeyType::Text)
}

pub fn transcript() -> ResourceDescriptor {
    ResourceDescriptor::new(
        "transcript",
        OwnershipTemplate::ParentOwned {
            parent_type: "session".into(),
            reference_field: "session_id".into(),
        },
    )
    .with_key_type(KeyType::Text)
}

pub fn exercise() -> ResourceDescriptor {
    ResourceDescriptor::new(
        "exercise",
        OwnershipTemplate::Catalog {
            creator_field: "created_by".into(),
        },
    )
    .with_key_type(KeyType::Text)
}

pub fn sync_job() -> ResourceDescriptor {
    ResourceDescriptor::new("sync_job", OwnershipTemplate::ServiceOnly)
        .with_key_type(KeyType::Text)
        .unaudited()
}

pub fn egress_target() -> ResourceDescriptor {
    ResourceDescriptor::direct_owner("egress_target", "user_id")
        .with_key_type(KeyType::Text)
        .restricted()
}

pub fn all_descriptors() -> Vec<ResourceDescriptor> {
    vec![
        conversation(),
        journal(),
        connection(),
        group_room(),
        session(),
        transcript(),
        exercise(),
        sync_job(),
        egress_target(),
    ]
}

/// Registry over every fixture type, with the indexes they need.
pub fn registry() -> DescriptorRegistry {
    let mut builder = RegistryBuilder::new();
    for descriptor in all_descriptors() {
        builder = builder.register(descriptor);
    }
    builder
        .declare_index(IndexSpec::btree("conversation", &["user_id"]))
        .declare_index(IndexSpec::btree("journal_entry", &["user_id"]))
        .declare_index(IndexSpec::btree("connection", &["user_id"]))
        .declare_index(IndexSpec::btree("connection", &["professional_id"]))
        .declare_index(IndexSpec::gin("group_room", "participant_ids"))
        .declare_index(IndexSpec::btree("session", &["user_id"]))
        .declare_index(IndexSpec::btree("transcript", &["session_id"]))
        .declare_index(IndexSpec::btree("egress_target", &["user_id"]))
        .accessor(Arc::new(ProjectionAccessor::new(ProjectionAccessorConfig {
            name: "my_egress_targets".into(),
            resource_type: "egress_target".into(),
            owner_field: "user_id".into(),
            fields: vec!["id".into(), "label".into(), "status".into()],
            max_rows: Some(2),
        })))
        .build()
        .expect("fixture registry must build")
}

pub struct TestContext {
    pub engine: AuthzEngine,
    pub store: InMemoryStore,
}

/// Engine over an empty in-memory store.
pub fn spawn_engine() -> TestContext {
    init_tracing();
    let store = InMemoryStore::new();
    let engine = AuthzEngine::new(Arc::new(registry()), Arc::new(store.clone()));
    TestContext { engine, store }
}

/// Engine over a store holding the standard fixture rows:
/// conversation c1 (owner a), connection k1 (a, b), session s1 (a),
/// transcript t1 (in s1), room r1 (a, c), exercise e1 (by a), job j1,
/// egress targets for a.
pub async fn spawn_seeded_engine() -> TestContext {
    let ctx = spawn_engine();
    let store = &ctx.store;
    seed(store, &conversation(), json!({"id": "c1", "user_id": "a", "title": "Intro"})).await;
    seed(store, &conversation(), json!({"id": "c2", "user_id": "b", "title": "Other"})).await;
    seed(store, &connection(), json!({"id": "k1", "user_id": "a", "professional_id": "b"})).await;
    seed(store, &session(), json!({"id": "s1", "user_id": "a"})).await;
    seed(store, &transcript(), json!({"id": "t1", "session_id": "s1", "text": "hello"})).await;
    seed(store, &group_room(), json!({"id": "r1", "participant_ids": ["a", "c"]})).await;
    seed(store, &exercise(), json!({"id": "e1", "created_by": "a", "name": "Breathing"})).await;
    seed(store, &sync_job(), json!({"id": "j1", "status": "queued"})).await;
    seed(
        store,
        &egress_target(),
        json!({"id": "x1", "user_id": "a", "label": "crm", "status": "active", "url": "https://crm.internal", "api_key": "k1"}),
    )
    .await;
    seed(
        store,
        &egress_target(),
        json!({"id": "x2", "user_id": "a", "label": "mail", "status": "paused", "url": "https://mail.internal", "api_key": "k2"}),
    )
    .await;
    seed(
        store,
        &egress_target(),
        json!({"id": "x3", "user_id": "a", "label": "chat", "status": "active", "url": "https://chat.internal", "api_key": "k3"}),
    )
    .await;
    seed(
        store,
        &egress_target(),
        json!({"id": "x4", "user_id": "b", "label": "other", "status": "active", "url": "https://b.internal", "api_key": "k4"}),
    )
    .await;
    ctx
}

pub async fn seed(store: &InMemoryStore, descriptor: &ResourceDescriptor, row: Value) {
    store
        .seed(descriptor, row)
        .await
        .expect("Failed to seed fixture row");
}

/// Ids of a list result, sorted.
pub fn ids(rows: &[Value]) -> Vec<String> {
    let mut ids: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    ids.sort();
    ids
}
