//! Resource descriptor model - static ownership configuration per resource type.

use serde::{Deserialize, Serialize};

/// How ownership of a row is determined. Every descriptor has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum OwnershipTemplate {
    /// A single column equals the principal id.
    DirectOwner { owner_field: String },
    /// Any of several columns equals the principal id.
    MultiOwner { owner_fields: Vec<String> },
    /// The principal id is a member of an array column.
    ParticipantSet { members_field: String },
    /// Ownership is inherited from the parent row `reference_field` points at.
    ParentOwned {
        parent_type: String,
        reference_field: String,
    },
    /// Readable by everyone; writable only by the row's creator.
    Catalog { creator_field: String },
    /// Reachable by service principals only.
    ServiceOnly,
}

impl OwnershipTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipTemplate::DirectOwner { .. } => "direct_owner",
            OwnershipTemplate::MultiOwner { .. } => "multi_owner",
            OwnershipTemplate::ParticipantSet { .. } => "participant_set",
            OwnershipTemplate::ParentOwned { .. } => "parent_owned",
            OwnershipTemplate::Catalog { .. } => "catalog",
            OwnershipTemplate::ServiceOnly => "service_only",
        }
    }

    /// Columns this template reads on the resource's own rows.
    pub fn predicate_fields(&self) -> Vec<&str> {
        match self {
            OwnershipTemplate::DirectOwner { owner_field } => vec![owner_field.as_str()],
            OwnershipTemplate::MultiOwner { owner_fields } => {
                owner_fields.iter().map(String::as_str).collect()
            }
            OwnershipTemplate::ParticipantSet { members_field } => vec![members_field.as_str()],
            OwnershipTemplate::ParentOwned {
                reference_field, ..
            } => vec![reference_field.as_str()],
            OwnershipTemplate::Catalog { creator_field } => vec![creator_field.as_str()],
            OwnershipTemplate::ServiceOnly => vec![],
        }
    }

    /// Whether a parent-owned resource may inherit from a row of this template.
    pub fn is_row_owned(&self) -> bool {
        matches!(
            self,
            OwnershipTemplate::DirectOwner { .. }
                | OwnershipTemplate::MultiOwner { .. }
                | OwnershipTemplate::ParticipantSet { .. }
        )
    }
}

/// Namespace placement. Restricted types back risky capabilities (egress,
/// foreign mirrors) and are only reachable through registered accessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    #[default]
    Public,
    Restricted,
}

/// Column type of the id and owner columns, used for SQL casts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Uuid,
    Text,
    Bigint,
}

impl KeyType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            KeyType::Uuid => "uuid",
            KeyType::Text => "text",
            KeyType::Bigint => "bigint",
        }
    }

    /// Whether `value` can be cast to this key type. Values that cannot never
    /// match a stored key.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            KeyType::Uuid => uuid::Uuid::parse_str(value).is_ok(),
            KeyType::Text => true,
            KeyType::Bigint => value.parse::<i64>().is_ok(),
        }
    }
}

/// Static, read-only description of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_type: String,
    pub ownership: OwnershipTemplate,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub facilitator_visible: bool,
    #[serde(default = "default_audited")]
    pub audited: bool,
    #[serde(default)]
    pub namespace: Namespace,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_audited() -> bool {
    true
}

impl ResourceDescriptor {
    /// Public, audited, not facilitator-visible, keyed by `id`.
    pub fn new(resource_type: impl Into<String>, ownership: OwnershipTemplate) -> Self {
        Self {
            resource_type: resource_type.into(),
            ownership,
            id_field: default_id_field(),
            key_type: KeyType::default(),
            facilitator_visible: false,
            audited: default_audited(),
            namespace: Namespace::default(),
        }
    }

    pub fn direct_owner(resource_type: impl Into<String>, owner_field: impl Into<String>) -> Self {
        Self::new(
            resource_type,
            OwnershipTemplate::DirectOwner {
                owner_field: owner_field.into(),
            },
        )
    }

    pub fn facilitator_visible(mut self) -> Self {
        self.facilitator_visible = true;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.namespace = Namespace::Restricted;
        self
    }

    pub fn unaudited(mut self) -> Self {
        self.audited = false;
        self
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn is_restricted(&self) -> bool {
        self.namespace == Namespace::Restricted
    }
}

/// Accepts lowercase SQL identifiers: `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
