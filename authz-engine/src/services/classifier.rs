//! Ownership classification: who owns a row, per its descriptor's template.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::models::{field_key, owner_key, OwnershipTemplate, ResourceDescriptor};
use crate::services::error::AuthzError;
use crate::services::registry::DescriptorRegistry;
use crate::store::{Store, StoreError, StoreTransaction};

/// Owners of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerSet {
    /// Explicit principal ids. Empty when every owner column is null.
    Principals(BTreeSet<String>),
    /// Everyone may read; only `creator` may write.
    Catalog { creator: Option<String> },
    /// No principal owns the row.
    ServiceOnly,
}

impl OwnerSet {
    /// Whether `principal_id` owns the row for write purposes.
    pub fn contains(&self, principal_id: &str) -> bool {
        match self {
            OwnerSet::Principals(ids) => ids.contains(principal_id),
            OwnerSet::Catalog { creator } => creator.as_deref() == Some(principal_id),
            OwnerSet::ServiceOnly => false,
        }
    }
}

/// Source of parent rows for parent-owned resources.
#[async_trait]
pub trait ParentLookup: Send {
    async fn parent_row(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError>;
}

/// Parent lookups outside a transaction.
pub struct StoreLookup<'a>(pub &'a dyn Store);

#[async_trait]
impl<'a> ParentLookup for StoreLookup<'a> {
    async fn parent_row(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.0.get(descriptor, id).await
    }
}

/// Parent lookups inside a mutation's transaction, so the parent is locked
/// until commit.
pub struct TxLookup<'a>(pub &'a mut dyn StoreTransaction);

#[async_trait]
impl<'a> ParentLookup for TxLookup<'a> {
    async fn parent_row(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.0.get(descriptor, id).await
    }
}

/// Owners of a row whose template needs no secondary read.
///
/// Returns `None` for parent-owned templates.
pub fn row_owners(template: &OwnershipTemplate, row: &Value) -> Option<OwnerSet> {
    let owners = match template {
        OwnershipTemplate::DirectOwner { owner_field } => {
            OwnerSet::Principals(field_key(row, owner_field).into_iter().collect())
        }
        OwnershipTemplate::MultiOwner { owner_fields } => OwnerSet::Principals(
            owner_fields
                .iter()
                .filter_map(|field| field_key(row, field))
                .collect(),
        ),
        OwnershipTemplate::ParticipantSet { members_field } => {
            let members = match row.get(members_field) {
                Some(Value::Array(members)) => members.iter().filter_map(owner_key).collect(),
                _ => BTreeSet::new(),
            };
            OwnerSet::Principals(members)
        }
        OwnershipTemplate::Catalog { creator_field } => OwnerSet::Catalog {
            creator: field_key(row, creator_field),
        },
        OwnershipTemplate::ServiceOnly => OwnerSet::ServiceOnly,
        OwnershipTemplate::ParentOwned { .. } => return None,
    };
    Some(owners)
}

pub struct OwnershipClassifier<'a> {
    registry: &'a DescriptorRegistry,
}

impl<'a> OwnershipClassifier<'a> {
    pub fn new(registry: &'a DescriptorRegistry) -> Self {
        Self { registry }
    }

    /// Classify a stored row or an insert payload.
    ///
    /// Parent-owned rows cost exactly one lookup. A missing reference or a
    /// missing parent is `ParentUnresolvable`; a failing lookup is
    /// `StoreUnavailable`. Neither ever yields owners.
    pub async fn classify(
        &self,
        descriptor: &ResourceDescriptor,
        row: &Value,
        lookup: &mut dyn ParentLookup,
    ) -> Result<OwnerSet, AuthzError> {
        if let Some(owners) = row_owners(&descriptor.ownership, row) {
            return Ok(owners);
        }

        let OwnershipTemplate::ParentOwned {
            parent_type,
            reference_field,
        } = &descriptor.ownership
        else {
            return Err(AuthzError::Misconfigured(format!(
                "no classification for {}",
                descriptor.resource_type
            )));
        };

        let unresolvable = || AuthzError::ParentUnresolvable {
            resource_type: descriptor.resource_type.clone(),
            parent_type: parent_type.clone(),
        };

        let parent_descriptor = self.registry.get(parent_type).ok_or_else(|| {
            AuthzError::Misconfigured(format!(
                "{} references unregistered parent {}",
                descriptor.resource_type, parent_type
            ))
        })?;

        let Some(parent_id) = field_key(row, reference_field) else {
            debug!(
                resource_type = %descriptor.resource_type,
                reference_field = %reference_field,
                "Row has no parent reference"
            );
            return Err(unresolvable());
        };

        let parent = lookup
            .parent_row(parent_descriptor, &parent_id)
            .await
            .map_err(AuthzError::StoreUnavailable)?
            .ok_or_else(unresolvable)?;

        // Registry validation only admits row-owned parents, so this never
        // recurses into another parent lookup.
        row_owners(&parent_descriptor.ownership, &parent).ok_or_else(|| {
            AuthzError::Misconfigured(format!(
                "parent {} of {} is itself parent-owned",
                parent_type, descriptor.resource_type
            ))
        })
    }
}
