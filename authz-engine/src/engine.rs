//! The authorization engine: every principal-scoped access goes through here.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::models::{
    field_key, AuditEntry, Decision, DenyReason, Operation, OwnershipTemplate, Principal,
    ResourceDescriptor, RowFilter,
};
use crate::services::metrics::{DECISIONS_TOTAL, ERRORS_TOTAL};
use crate::services::{
    AuditEvent, AuditRecorder, AuthzError, DescriptorRegistry, FacilitatorGate, PolicyEvaluator,
    ServiceBypass, StoreLookup, TxLookup,
};
use crate::store::{apply_changes, CommitToken, Mutation, Store, StoreError, StoreTransaction};

/// What an authorization question is about.
#[derive(Debug, Clone, Copy)]
pub enum Candidate<'a> {
    /// A stored row, or the payload of an insert.
    Row(&'a Value),
    /// Every row of the type, as for a list.
    Collection,
}

/// Result of a committed mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub resource_id: String,
    /// Row as stored after the write. The removed row for deletes.
    pub row: Value,
    /// `None` for unaudited resource types.
    pub audit: Option<AuditEntry>,
    pub commit: CommitToken,
}

pub struct AuthzEngine {
    registry: Arc<DescriptorRegistry>,
    store: Arc<dyn Store>,
    recorder: AuditRecorder,
}

impl AuthzEngine {
    pub fn new(registry: Arc<DescriptorRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            recorder: AuditRecorder::new(),
        }
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    fn evaluator(&self) -> PolicyEvaluator<'_> {
        PolicyEvaluator::new(&self.registry)
    }

    fn descriptor(&self, resource_type: &str) -> Result<&ResourceDescriptor, AuthzError> {
        self.registry.get(resource_type).ok_or_else(|| {
            error!(resource_type = %resource_type, "No descriptor registered for resource type");
            ERRORS_TOTAL.with_label_values(&["misconfigured"]).inc();
            AuthzError::Misconfigured(format!("no descriptor for {}", resource_type))
        })
    }

    /// The single decision point.
    ///
    /// An unregistered type is `Deny(Misconfigured)`, never an error and
    /// never an allow. A failing store is an error.
    #[instrument(skip(self, principal, candidate), fields(principal = %principal.id()))]
    pub async fn authorize(
        &self,
        principal: &Principal,
        resource_type: &str,
        operation: Operation,
        candidate: Candidate<'_>,
    ) -> Result<Decision, AuthzError> {
        let descriptor = match self.descriptor(resource_type) {
            Ok(descriptor) => descriptor,
            Err(AuthzError::Misconfigured(_)) => {
                DECISIONS_TOTAL
                    .with_label_values(&["unregistered", operation.as_str(), "deny_misconfigured"])
                    .inc();
                return Ok(Decision::Deny(DenyReason::Misconfigured));
            }
            Err(err) => return Err(err),
        };

        let evaluator = self.evaluator();
        let decision = match candidate {
            Candidate::Row(row) => {
                let mut lookup = StoreLookup(self.store.as_ref());
                evaluator
                    .evaluate_row(principal, descriptor, operation, row, &mut lookup)
                    .await
            }
            Candidate::Collection if operation.is_read() => {
                evaluator.evaluate_collection(principal, descriptor)
            }
            // Collection-wide writes are a service-only affair.
            Candidate::Collection => Ok(if ServiceBypass::applies(principal) {
                Decision::Allow
            } else {
                Decision::Deny(DenyReason::Policy)
            }),
        }
        .inspect_err(|err| self.count_error(err))?;

        debug!(
            resource_type = %resource_type,
            operation = %operation,
            outcome = decision.outcome_label(),
            "Authorization decided"
        );
        Ok(decision)
    }

    /// Read one row. A missing row and a row the caller may not read fail
    /// identically.
    #[instrument(skip(self, principal), fields(principal = %principal.id()))]
    pub async fn read(
        &self,
        principal: &Principal,
        resource_type: &str,
        id: &str,
    ) -> Result<Value, AuthzError> {
        let descriptor = self.descriptor(resource_type)?;
        let row = self
            .store
            .get(descriptor, id)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or(AuthzError::Denied)?;

        let mut lookup = StoreLookup(self.store.as_ref());
        let decision = self
            .evaluator()
            .evaluate_row(principal, descriptor, Operation::Read, &row, &mut lookup)
            .await
            .inspect_err(|err| self.count_error(err))?;
        deny_unless_allowed(&decision)?;
        Ok(row)
    }

    /// List the rows the caller may read, optionally narrowed by `filter`.
    /// Ownership is pushed down to the store as a residual filter.
    #[instrument(skip(self, principal, filter), fields(principal = %principal.id()))]
    pub async fn list(
        &self,
        principal: &Principal,
        resource_type: &str,
        filter: Option<RowFilter>,
    ) -> Result<Vec<Value>, AuthzError> {
        let descriptor = self.descriptor(resource_type)?;
        let decision = self
            .evaluator()
            .evaluate_collection(principal, descriptor)
            .inspect_err(|err| self.count_error(err))?;

        let effective = match decision {
            Decision::Allow => filter,
            Decision::AllowWithFilter(residual) => Some(match filter {
                Some(extra) => residual.and(extra),
                None => residual,
            }),
            Decision::Deny(reason) => {
                debug!(reason = reason.as_str(), "List denied");
                return Err(AuthzError::Denied);
            }
        };

        self.store
            .query(descriptor, effective.as_ref())
            .await
            .map_err(|e| self.store_failure(e))
    }

    /// Authorize, apply and audit one mutation in a single transaction.
    ///
    /// Nothing is visible until commit; an error or a dropped future leaves
    /// neither the write nor its audit entry behind.
    #[instrument(skip(self, principal, mutation), fields(principal = %principal.id(), operation = %mutation.operation()))]
    pub async fn mutate(
        &self,
        principal: &Principal,
        resource_type: &str,
        mutation: Mutation,
        request_id: Option<&str>,
    ) -> Result<MutationOutcome, AuthzError> {
        let descriptor = self.descriptor(resource_type)?;
        let evaluator = self.evaluator();
        let operation = mutation.operation();

        let mut tx = self.store.begin().await.map_err(|e| self.store_failure(e))?;

        let before = match &mutation {
            Mutation::Insert { payload } => {
                if !payload.is_object() {
                    return Err(AuthzError::InvalidRequest(
                        "insert payload must be a JSON object".into(),
                    ));
                }
                let decision = evaluator
                    .evaluate_row(
                        principal,
                        descriptor,
                        operation,
                        payload,
                        &mut TxLookup(tx.as_mut()),
                    )
                    .await
                    .inspect_err(|err| self.count_error(err))?;
                deny_unless_allowed(&decision)?;
                None
            }
            Mutation::Update { id, changes } => {
                if changes.get(&descriptor.id_field).is_some()
                    && field_key(changes, &descriptor.id_field).as_deref() != Some(id.as_str())
                {
                    return Err(AuthzError::InvalidRequest(format!(
                        "{} cannot be changed",
                        descriptor.id_field
                    )));
                }
                let before = self.locked_row(tx.as_mut(), descriptor, id).await?;
                let after = apply_changes(&before, changes).map_err(AuthzError::from_store)?;
                let decision = evaluator
                    .evaluate_update(
                        principal,
                        descriptor,
                        &before,
                        &after,
                        &mut TxLookup(tx.as_mut()),
                    )
                    .await
                    .inspect_err(|err| self.count_error(err))?;
                deny_unless_allowed(&decision)?;
                Some(before)
            }
            Mutation::Delete { id } => {
                let before = self.locked_row(tx.as_mut(), descriptor, id).await?;
                let decision = evaluator
                    .evaluate_row(
                        principal,
                        descriptor,
                        operation,
                        &before,
                        &mut TxLookup(tx.as_mut()),
                    )
                    .await
                    .inspect_err(|err| self.count_error(err))?;
                deny_unless_allowed(&decision)?;
                Some(before)
            }
        };

        let row = tx
            .mutate(descriptor, &mutation)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or(AuthzError::Denied)?;

        let resource_id = match mutation.target_id() {
            Some(id) => id.to_string(),
            None => field_key(&row, &descriptor.id_field).ok_or_else(|| {
                self.store_failure(StoreError::Unavailable(format!(
                    "inserted {} row has no {}",
                    descriptor.resource_type, descriptor.id_field
                )))
            })?,
        };

        let audit = if descriptor.audited {
            let after = match operation {
                Operation::Delete => None,
                _ => Some(row.clone()),
            };
            let entry = self
                .recorder
                .record(
                    tx.as_mut(),
                    AuditEvent {
                        actor: principal,
                        resource_type,
                        resource_id: &resource_id,
                        operation,
                        before,
                        after,
                        request_id,
                    },
                )
                .await
                .map_err(|e| self.store_failure(e))?;
            Some(entry)
        } else {
            None
        };

        let commit = tx.commit().await.map_err(|e| self.store_failure(e))?;

        info!(
            resource_type = %resource_type,
            resource_id = %resource_id,
            transaction_id = %commit.transaction_id,
            "Mutation committed"
        );

        Ok(MutationOutcome {
            resource_id,
            row,
            audit,
            commit,
        })
    }

    /// Audit entries of one resource, oldest first. Callers need read access
    /// to the resource; for deleted rows the last audited state decides.
    /// Catalog history is limited to the creator and facilitators.
    #[instrument(skip(self, principal), fields(principal = %principal.id()))]
    pub async fn audit_trail(
        &self,
        principal: &Principal,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, AuthzError> {
        let descriptor = self.descriptor(resource_type)?;
        let entries = self
            .store
            .audit_entries(resource_type, resource_id)
            .await
            .map_err(|e| self.store_failure(e))?;

        if ServiceBypass::applies(principal) {
            return Ok(entries);
        }

        let current = self
            .store
            .get(descriptor, resource_id)
            .await
            .map_err(|e| self.store_failure(e))?;
        let candidate = current
            .as_ref()
            .or_else(|| entries.last().and_then(AuditEntry::last_known_state))
            .ok_or(AuthzError::Denied)?;

        let mut lookup = StoreLookup(self.store.as_ref());
        let decision = self
            .evaluator()
            .evaluate_row(principal, descriptor, Operation::Read, candidate, &mut lookup)
            .await
            .inspect_err(|err| self.count_error(err))?;
        deny_unless_allowed(&decision)?;

        if let OwnershipTemplate::Catalog { creator_field } = &descriptor.ownership {
            let is_creator = field_key(candidate, creator_field).as_deref() == Some(principal.id());
            if !is_creator && !FacilitatorGate::grants(principal, descriptor, Operation::Read) {
                debug!(resource_type = %resource_type, "Catalog audit trail denied to non-creator");
                return Err(AuthzError::Denied);
            }
        }
        Ok(entries)
    }

    /// Run a restricted-namespace accessor.
    #[instrument(skip(self, principal, args), fields(principal = %principal.id()))]
    pub async fn invoke_accessor(
        &self,
        principal: &Principal,
        name: &str,
        args: &Value,
    ) -> Result<Value, AuthzError> {
        self.registry
            .boundary()
            .invoke(principal, name, args, self.store.as_ref())
            .await
            .inspect_err(|err| self.count_error(err))
    }

    async fn locked_row(
        &self,
        tx: &mut dyn StoreTransaction,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Value, AuthzError> {
        tx.get(descriptor, id)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or(AuthzError::Denied)
    }

    fn store_failure(&self, err: StoreError) -> AuthzError {
        let err = AuthzError::from_store(err);
        self.count_error(&err);
        err
    }

    fn count_error(&self, err: &AuthzError) {
        if err.is_operational() {
            error!(error = %err, "Authorization engine failure");
            ERRORS_TOTAL.with_label_values(&[err.error_type()]).inc();
        }
    }
}

fn deny_unless_allowed(decision: &Decision) -> Result<(), AuthzError> {
    match decision {
        Decision::Deny(reason) => {
            debug!(reason = reason.as_str(), "Access denied");
            Err(AuthzError::Denied)
        }
        _ => Ok(()),
    }
}
