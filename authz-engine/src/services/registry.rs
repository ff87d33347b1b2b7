//! Descriptor registry: built and validated once at startup, then shared
//! read-only.

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::models::{is_valid_identifier, OwnershipTemplate, ResourceDescriptor};
use crate::services::error::RegistryError;
use crate::services::index_advisor::{find_gaps, IndexSpec};
use crate::services::isolation::{
    IsolationBoundary, ProjectionAccessor, ProjectionAccessorConfig, RestrictedAccessor,
};

/// Declarative descriptor file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSet {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub accessors: Vec<ProjectionAccessorConfig>,
}

impl DescriptorSet {
    /// Load a TOML, YAML or JSON file, format picked by extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let set = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        Ok(set)
    }

    pub fn parse(contents: &str, format: FileFormat) -> Result<Self, RegistryError> {
        let set = Config::builder()
            .add_source(File::from_str(contents, format))
            .build()?
            .try_deserialize()?;
        Ok(set)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ResourceDescriptor>,
    indexes: Vec<IndexSpec>,
    accessors: Vec<Arc<dyn RestrictedAccessor>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_set(set: DescriptorSet) -> Self {
        let mut builder = Self {
            descriptors: set.resources,
            indexes: set.indexes,
            accessors: Vec::new(),
        };
        for config in set.accessors {
            builder = builder.accessor(Arc::new(ProjectionAccessor::new(config)));
        }
        builder
    }

    pub fn register(mut self, descriptor: ResourceDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Record an index that exists on the backing store.
    pub fn declare_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn accessor(mut self, accessor: Arc<dyn RestrictedAccessor>) -> Self {
        self.accessors.push(accessor);
        self
    }

    /// Validate everything and freeze the registry.
    #[instrument(skip(self), fields(resources = self.descriptors.len()))]
    pub fn build(self) -> Result<DescriptorRegistry, RegistryError> {
        let mut descriptors = HashMap::with_capacity(self.descriptors.len());
        for descriptor in self.descriptors {
            validate_identifiers(&descriptor)?;
            if let OwnershipTemplate::MultiOwner { owner_fields } = &descriptor.ownership {
                if owner_fields.is_empty() {
                    return Err(RegistryError::EmptyOwnerFields(descriptor.resource_type));
                }
            }
            if descriptors.contains_key(&descriptor.resource_type) {
                return Err(RegistryError::DuplicateResource(descriptor.resource_type));
            }
            descriptors.insert(descriptor.resource_type.clone(), descriptor);
        }

        for descriptor in descriptors.values() {
            if let OwnershipTemplate::ParentOwned { parent_type, .. } = &descriptor.ownership {
                let parent =
                    descriptors
                        .get(parent_type)
                        .ok_or_else(|| RegistryError::UnknownParent {
                            resource_type: descriptor.resource_type.clone(),
                            parent_type: parent_type.clone(),
                        })?;
                if !parent.ownership.is_row_owned() {
                    return Err(RegistryError::InvalidParentTemplate {
                        resource_type: descriptor.resource_type.clone(),
                        parent_type: parent_type.clone(),
                        template: parent.ownership.as_str().to_string(),
                    });
                }
            }
        }

        let mut gaps = find_gaps(descriptors.values(), &self.indexes);
        if !gaps.is_empty() {
            gaps.sort_by(|a, b| {
                (&a.resource_type, &a.column).cmp(&(&b.resource_type, &b.column))
            });
            return Err(RegistryError::UnindexedPredicates(gaps));
        }

        let mut boundary = IsolationBoundary::default();
        for accessor in self.accessors {
            let name = accessor.name().to_string();
            if boundary.contains(&name) {
                return Err(RegistryError::DuplicateAccessor(name));
            }
            if let Some(column) = accessor.columns().into_iter().find(|c| !is_valid_identifier(c)) {
                return Err(RegistryError::InvalidAccessor {
                    accessor: name,
                    reason: format!("invalid column {column:?}"),
                });
            }
            let descriptor = descriptors.get(accessor.resource_type()).ok_or_else(|| {
                RegistryError::InvalidAccessor {
                    accessor: name.clone(),
                    reason: format!("unknown resource type {}", accessor.resource_type()),
                }
            })?;
            if !descriptor.is_restricted() {
                return Err(RegistryError::InvalidAccessor {
                    accessor: name,
                    reason: format!("{} is not restricted", descriptor.resource_type),
                });
            }
            boundary.insert(accessor, descriptor.clone());
        }

        info!(
            resources = descriptors.len(),
            accessors = boundary.names().count(),
            "Descriptor registry built"
        );

        Ok(DescriptorRegistry {
            descriptors,
            indexes: self.indexes,
            boundary,
        })
    }
}

fn validate_identifiers(descriptor: &ResourceDescriptor) -> Result<(), RegistryError> {
    let mut identifiers = vec![
        descriptor.resource_type.as_str(),
        descriptor.id_field.as_str(),
    ];
    identifiers.extend(descriptor.ownership.predicate_fields());
    if let OwnershipTemplate::ParentOwned { parent_type, .. } = &descriptor.ownership {
        identifiers.push(parent_type);
    }
    match identifiers.into_iter().find(|i| !is_valid_identifier(i)) {
        Some(bad) => Err(RegistryError::InvalidIdentifier {
            resource_type: descriptor.resource_type.clone(),
            identifier: bad.to_string(),
        }),
        None => Ok(()),
    }
}

/// Frozen, validated descriptors.
pub struct DescriptorRegistry {
    descriptors: HashMap<String, ResourceDescriptor>,
    indexes: Vec<IndexSpec>,
    boundary: IsolationBoundary,
}

impl DescriptorRegistry {
    pub fn get(&self, resource_type: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.get(resource_type)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.values()
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
