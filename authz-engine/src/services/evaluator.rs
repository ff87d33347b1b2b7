//! Policy evaluation.
//!
//! Order: service bypass, namespace isolation, facilitator oversight,
//! ownership template, default deny.

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    Decision, DenyReason, Operation, OwnershipTemplate, Principal, ResourceDescriptor, RowFilter,
};
use crate::services::classifier::{OwnerSet, OwnershipClassifier, ParentLookup};
use crate::services::error::AuthzError;
use crate::services::gates::{FacilitatorGate, ServiceBypass};
use crate::services::metrics::{DECISIONS_TOTAL, ERRORS_TOTAL};
use crate::services::registry::DescriptorRegistry;

pub struct PolicyEvaluator<'a> {
    registry: &'a DescriptorRegistry,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(registry: &'a DescriptorRegistry) -> Self {
        Self { registry }
    }

    /// Decisions that never depend on row contents.
    pub fn short_circuit(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        operation: Operation,
    ) -> Option<Decision> {
        if ServiceBypass::applies(principal) {
            return Some(Decision::Allow);
        }
        if descriptor.is_restricted() {
            return Some(Decision::Deny(DenyReason::Isolated));
        }
        // The gate already requires a read; checked again so a gate change
        // can never open writes.
        if FacilitatorGate::grants(principal, descriptor, operation) && operation.is_read() {
            return Some(Decision::Allow);
        }
        if descriptor.ownership == OwnershipTemplate::ServiceOnly {
            return Some(Decision::Deny(DenyReason::Policy));
        }
        None
    }

    /// Decide for one row (stored row for read/update/delete, payload for
    /// insert).
    pub async fn evaluate_row(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        operation: Operation,
        row: &Value,
        lookup: &mut dyn ParentLookup,
    ) -> Result<Decision, AuthzError> {
        let decision = self
            .decide_row(principal, descriptor, operation, row, lookup)
            .await?;
        record(descriptor, operation, &decision);
        Ok(decision)
    }

    /// Update check: the stored row must allow the update (USING) and so must
    /// the row as it will look afterwards (WITH CHECK). Counted as one
    /// decision.
    pub async fn evaluate_update(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        before: &Value,
        after: &Value,
        lookup: &mut dyn ParentLookup,
    ) -> Result<Decision, AuthzError> {
        let using = self
            .decide_row(principal, descriptor, Operation::Update, before, lookup)
            .await?;
        let decision = if using.is_denied() {
            using
        } else {
            let check = self
                .decide_row(principal, descriptor, Operation::Update, after, lookup)
                .await?;
            if check.is_denied() {
                debug!(
                    principal = %principal.id(),
                    resource_type = %descriptor.resource_type,
                    "Update would move the row out of the caller's ownership"
                );
            }
            check
        };
        record(descriptor, Operation::Update, &decision);
        Ok(decision)
    }

    async fn decide_row(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        operation: Operation,
        row: &Value,
        lookup: &mut dyn ParentLookup,
    ) -> Result<Decision, AuthzError> {
        if let Some(decision) = self.short_circuit(principal, descriptor, operation) {
            return Ok(decision);
        }
        let classifier = OwnershipClassifier::new(self.registry);
        match classifier.classify(descriptor, row, lookup).await {
            Ok(owners) => Ok(decide_for_owners(principal, operation, &owners)),
            Err(AuthzError::ParentUnresolvable {
                resource_type,
                parent_type,
            }) => {
                warn!(
                    principal = %principal.id(),
                    resource_type = %resource_type,
                    parent_type = %parent_type,
                    operation = %operation,
                    "Parent row unresolvable, denying"
                );
                ERRORS_TOTAL
                    .with_label_values(&["parent_unresolvable"])
                    .inc();
                Ok(Decision::Deny(DenyReason::ParentUnresolvable))
            }
            Err(err) => Err(err),
        }
    }

    /// Decide for a collection read. Row-owned templates yield a residual
    /// filter for the store to apply.
    pub fn evaluate_collection(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
    ) -> Result<Decision, AuthzError> {
        let decision = match self.short_circuit(principal, descriptor, Operation::Read) {
            Some(decision) => decision,
            None => match &descriptor.ownership {
                OwnershipTemplate::Catalog { .. } => Decision::Allow,
                OwnershipTemplate::ParentOwned {
                    parent_type,
                    reference_field,
                } => {
                    let parent = self.registry.get(parent_type).ok_or_else(|| {
                        AuthzError::Misconfigured(format!(
                            "{} references unregistered parent {}",
                            descriptor.resource_type, parent_type
                        ))
                    })?;
                    let parent_filter = owner_filter(&parent.ownership, principal.id())
                        .ok_or_else(|| {
                            AuthzError::Misconfigured(format!(
                                "parent {} of {} has no row owners",
                                parent_type, descriptor.resource_type
                            ))
                        })?;
                    Decision::AllowWithFilter(RowFilter::ParentMatches {
                        reference_field: reference_field.clone(),
                        parent_type: parent_type.clone(),
                        parent_id_field: parent.id_field.clone(),
                        parent_key_type: parent.key_type,
                        parent_filter: Box::new(parent_filter),
                    })
                }
                template => match owner_filter(template, principal.id()) {
                    Some(filter) => Decision::AllowWithFilter(filter),
                    None => Decision::Deny(DenyReason::Policy),
                },
            },
        };
        record(descriptor, Operation::Read, &decision);
        Ok(decision)
    }
}

/// Template decision once owners are known.
fn decide_for_owners(principal: &Principal, operation: Operation, owners: &OwnerSet) -> Decision {
    let allowed = match owners {
        OwnerSet::Catalog { .. } if operation.is_read() => true,
        owners => owners.contains(principal.id()),
    };
    if allowed {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::Policy)
    }
}

/// Residual filter selecting the rows `principal_id` owns.
fn owner_filter(template: &OwnershipTemplate, principal_id: &str) -> Option<RowFilter> {
    match template {
        OwnershipTemplate::DirectOwner { owner_field } => Some(RowFilter::OwnerEq {
            field: owner_field.clone(),
            principal_id: principal_id.to_string(),
        }),
        OwnershipTemplate::MultiOwner { owner_fields } => Some(RowFilter::AnyOwnerEq {
            fields: owner_fields.clone(),
            principal_id: principal_id.to_string(),
        }),
        OwnershipTemplate::ParticipantSet { members_field } => Some(RowFilter::OwnerContains {
            field: members_field.clone(),
            principal_id: principal_id.to_string(),
        }),
        _ => None,
    }
}

fn record(descriptor: &ResourceDescriptor, operation: Operation, decision: &Decision) {
    DECISIONS_TOTAL
        .with_label_values(&[
            descriptor.ownership.as_str(),
            operation.as_str(),
            decision.outcome_label(),
        ])
        .inc();
}
