//! Mutations: authorization, atomic audit, rollback.

mod common;

use async_trait::async_trait;
use authz_engine::models::{
    AuditEntry, AuditLink, Operation, Principal, PrincipalKind, ResourceDescriptor, RowFilter,
};
use authz_engine::services::{verify_chain, AuthzError};
use authz_engine::store::{
    CommitToken, InMemoryStore, Mutation, Store, StoreError, StoreTransaction,
};
use authz_engine::AuthzEngine;
use common::{registry, spawn_engine, spawn_seeded_engine};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_insert_update_delete_are_audited() {
    let ctx = spawn_engine();
    let owner = Principal::user("a");

    let inserted = ctx
        .engine
        .mutate(
            &owner,
            "journal_entry",
            Mutation::Insert {
                payload: json!({"id": "j1", "user_id": "a", "body": "day one"}),
            },
            Some("req-1"),
        )
        .await
        .unwrap();
    assert_eq!(inserted.resource_id, "j1");

    ctx.engine
        .mutate(
            &owner,
            "journal_entry",
            Mutation::Update {
                id: "j1".into(),
                changes: json!({"body": "day one, edited"}),
            },
            Some("req-2"),
        )
        .await
        .unwrap();

    let deleted = ctx
        .engine
        .mutate(
            &owner,
            "journal_entry",
            Mutation::Delete { id: "j1".into() },
            None,
        )
        .await
        .unwrap();
    assert_eq!(deleted.row["body"], "day one, edited");

    let log = ctx.store.audit_log().await;
    let ops: Vec<Operation> = log.iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
    assert!(log.iter().all(|e| e.resource_id == "j1" && e.actor_id == "a"));
    assert!(log.iter().all(|e| e.actor_kind == PrincipalKind::User));

    assert!(log[0].before_state.is_none());
    assert_eq!(log[0].request_id.as_deref(), Some("req-1"));
    assert_eq!(log[1].before_state.as_ref().unwrap()["body"], "day one");
    assert_eq!(log[1].after_state.as_ref().unwrap()["body"], "day one, edited");
    assert!(log[2].after_state.is_none());

    assert_eq!(verify_chain(&log), Ok(()));
    assert_eq!(ctx.store.row_count("journal_entry").await, 0);
}

#[tokio::test]
async fn test_one_audit_entry_per_committed_mutation() {
    let ctx = spawn_engine();
    let owner = Principal::user("a");
    let mut committed = Vec::new();

    for i in 0..5 {
        let outcome = ctx
            .engine
            .mutate(
                &owner,
                "journal_entry",
                Mutation::Insert {
                    payload: json!({"id": format!("j{i}"), "user_id": "a"}),
                },
                None,
            )
            .await
            .unwrap();
        committed.push((outcome.resource_id, Operation::Insert));
    }
    for i in 0..3 {
        let id = format!("j{i}");
        ctx.engine
            .mutate(
                &owner,
                "journal_entry",
                Mutation::Update {
                    id: id.clone(),
                    changes: json!({"mood": i}),
                },
                None,
            )
            .await
            .unwrap();
        committed.push((id, Operation::Update));
    }
    // Denied attempts leave no trace.
    let denied = ctx
        .engine
        .mutate(
            &Principal::user("b"),
            "journal_entry",
            Mutation::Delete { id: "j4".into() },
            None,
        )
        .await;
    assert!(matches!(denied, Err(AuthzError::Denied)));

    let log = ctx.store.audit_log().await;
    let recorded: Vec<(String, Operation)> = log
        .iter()
        .map(|e| (e.resource_id.clone(), e.operation))
        .collect();
    assert_eq!(recorded, committed);
}

#[tokio::test]
async fn test_insert_for_someone_else_is_denied() {
    let ctx = spawn_engine();
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "journal_entry",
            Mutation::Insert {
                payload: json!({"id": "j1", "user_id": "b"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::Denied)));
    assert_eq!(ctx.store.row_count("journal_entry").await, 0);
}

#[tokio::test]
async fn test_update_cannot_transfer_ownership() {
    let ctx = spawn_seeded_engine().await;
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"user_id": "b"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::Denied)));

    let row = ctx
        .engine
        .read(&Principal::user("a"), "conversation", "c1")
        .await
        .unwrap();
    assert_eq!(row["user_id"], "a");
    assert!(ctx.store.audit_log().await.is_empty());
}

#[tokio::test]
async fn test_update_cannot_change_id() {
    let ctx = spawn_seeded_engine().await;
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"id": "c9"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_missing_and_unowned_rows_fail_alike() {
    let ctx = spawn_seeded_engine().await;
    let principal = Principal::user("a");

    let unowned = ctx
        .engine
        .mutate(&principal, "conversation", Mutation::Delete { id: "c2".into() }, None)
        .await
        .unwrap_err();
    let missing = ctx
        .engine
        .mutate(&principal, "conversation", Mutation::Delete { id: "nope".into() }, None)
        .await
        .unwrap_err();
    assert_eq!(unowned.to_string(), missing.to_string());
    assert!(matches!(missing, AuthzError::Denied));
}

#[tokio::test]
async fn test_facilitator_cannot_write_visible_type() {
    let ctx = spawn_seeded_engine().await;
    let result = ctx
        .engine
        .mutate(
            &Principal::facilitator("f"),
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"title": "edited"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::Denied)));
}

#[tokio::test]
async fn test_transcript_update_through_parent() {
    let ctx = spawn_seeded_engine().await;
    ctx.engine
        .mutate(
            &Principal::user("a"),
            "transcript",
            Mutation::Update {
                id: "t1".into(),
                changes: json!({"text": "hello again"}),
            },
            None,
        )
        .await
        .unwrap();

    // Moving the transcript to a session the caller does not own fails the
    // post-update check.
    common::seed(&ctx.store, &common::session(), json!({"id": "s2", "user_id": "b"})).await;
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "transcript",
            Mutation::Update {
                id: "t1".into(),
                changes: json!({"session_id": "s2"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::Denied)));

    ctx.store.remove(&common::session(), "s1").await;
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "transcript",
            Mutation::Update {
                id: "t1".into(),
                changes: json!({"text": "orphaned"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::Denied)));
}

#[tokio::test]
async fn test_service_writes_anywhere_and_is_audited() {
    let ctx = spawn_seeded_engine().await;
    let service = Principal::service("sync-worker");

    ctx.engine
        .mutate(
            &service,
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"title": "Archived"}),
            },
            Some("job-7"),
        )
        .await
        .unwrap();

    let log = ctx.store.audit_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].actor_kind, PrincipalKind::Service);
    assert_eq!(log[0].actor_id, "sync-worker");
}

#[tokio::test]
async fn test_unaudited_type_records_nothing() {
    let ctx = spawn_seeded_engine().await;
    let outcome = ctx
        .engine
        .mutate(
            &Principal::service("worker"),
            "sync_job",
            Mutation::Update {
                id: "j1".into(),
                changes: json!({"status": "done"}),
            },
            None,
        )
        .await
        .unwrap();
    assert!(outcome.audit.is_none());
    assert!(ctx.store.audit_log().await.is_empty());
}

#[tokio::test]
async fn test_failed_audit_rolls_back_mutation() {
    let ctx = spawn_seeded_engine().await;
    ctx.store.set_reject_audit(true);

    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"title": "never stored"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::StoreUnavailable(_))));

    ctx.store.set_reject_audit(false);
    let row = ctx
        .engine
        .read(&Principal::user("a"), "conversation", "c1")
        .await
        .unwrap();
    assert_eq!(row["title"], "Intro");
    assert!(ctx.store.audit_log().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_insert_is_invalid_request() {
    let ctx = spawn_seeded_engine().await;
    let result = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "conversation",
            Mutation::Insert {
                payload: json!({"id": "c1", "user_id": "a"}),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(AuthzError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_catalog_insert_requires_self_authorship() {
    let ctx = spawn_engine();
    let ok = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "exercise",
            Mutation::Insert {
                payload: json!({"id": "e9", "created_by": "a", "name": "Stretch"}),
            },
            None,
        )
        .await;
    assert!(ok.is_ok());

    let forged = ctx
        .engine
        .mutate(
            &Principal::user("a"),
            "exercise",
            Mutation::Insert {
                payload: json!({"id": "e10", "created_by": "b"}),
            },
            None,
        )
        .await;
    assert!(matches!(forged, Err(AuthzError::Denied)));
}

/// Store whose transactions never finish recording audit entries.
struct StallingStore {
    inner: InMemoryStore,
}

struct StallingTransaction {
    inner: Box<dyn StoreTransaction>,
}

#[async_trait]
impl Store for StallingStore {
    async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.inner.get(descriptor, id).await
    }

    async fn query(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        self.inner.query(descriptor, filter).await
    }

    async fn audit_entries(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.audit_entries(resource_type, resource_id).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(StallingTransaction {
            inner: self.inner.begin().await?,
        }))
    }
}

#[async_trait]
impl StoreTransaction for StallingTransaction {
    async fn get(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.inner.get(descriptor, id).await
    }

    async fn mutate(
        &mut self,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<Option<Value>, StoreError> {
        self.inner.mutate(descriptor, mutation).await
    }

    async fn last_audit_link(
        &mut self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<AuditLink>, StoreError> {
        self.inner.last_audit_link(resource_type, resource_id).await
    }

    async fn append_audit(&mut self, _entry: &AuditEntry) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn commit(self: Box<Self>) -> Result<CommitToken, StoreError> {
        self.inner.commit().await
    }
}

#[tokio::test]
async fn test_cancelled_mutation_leaves_no_effect() {
    common::init_tracing();
    let inner = InMemoryStore::new();
    common::seed(&inner, &common::conversation(), json!({"id": "c1", "user_id": "a", "title": "Intro"})).await;

    let engine = AuthzEngine::new(
        Arc::new(registry()),
        Arc::new(StallingStore {
            inner: inner.clone(),
        }),
    );

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        engine.mutate(
            &Principal::user("a"),
            "conversation",
            Mutation::Update {
                id: "c1".into(),
                changes: json!({"title": "half written"}),
            },
            None,
        ),
    )
    .await;
    assert!(result.is_err(), "mutation should have been cancelled");

    let row = inner
        .get(&common::conversation(), "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["title"], "Intro");
    assert!(inner.audit_log().await.is_empty());
}
