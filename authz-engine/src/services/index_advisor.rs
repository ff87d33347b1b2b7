//! Index coverage for owner predicates.
//!
//! Collection reads push an owner predicate down to the store; without an
//! index behind it every authorized list becomes a full scan. Registration
//! refuses descriptors whose predicates are not covered.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{OwnershipTemplate, ResourceDescriptor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMethod {
    #[default]
    Btree,
    Gin,
    Hash,
}

impl IndexMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMethod::Btree => "btree",
            IndexMethod::Gin => "gin",
            IndexMethod::Hash => "hash",
        }
    }

    /// Postgres access method name. Other methods are not tracked.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "btree" => Some(IndexMethod::Btree),
            "gin" => Some(IndexMethod::Gin),
            "hash" => Some(IndexMethod::Hash),
            _ => None,
        }
    }
}

/// An index that exists, declared in the descriptor file or read from a
/// live schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub resource_type: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub method: IndexMethod,
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSpec {
    pub fn btree(resource_type: &str, columns: &[&str]) -> Self {
        Self::with_method(resource_type, columns, IndexMethod::Btree)
    }

    pub fn gin(resource_type: &str, column: &str) -> Self {
        Self::with_method(resource_type, &[column], IndexMethod::Gin)
    }

    fn with_method(resource_type: &str, columns: &[&str], method: IndexMethod) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            method,
            name: None,
        }
    }

    /// Whether this index can serve `requirement`. B-tree and hash only help
    /// when the column leads; GIN serves containment on any of its columns.
    pub fn covers(&self, requirement: &IndexRequirement) -> bool {
        if self.resource_type != requirement.resource_type {
            return false;
        }
        let leading = self.columns.first().map(String::as_str) == Some(requirement.column.as_str());
        match (requirement.method, self.method) {
            (IndexMethod::Btree, IndexMethod::Btree) => leading,
            (IndexMethod::Btree, IndexMethod::Hash) => leading && self.columns.len() == 1,
            (IndexMethod::Gin, IndexMethod::Gin) => self.columns.contains(&requirement.column),
            _ => false,
        }
    }
}

/// One column that must be indexed, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexRequirement {
    pub resource_type: String,
    pub column: String,
    pub method: IndexMethod,
    pub template: &'static str,
}

impl fmt::Display for IndexRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} needs a {} index ({})",
            self.resource_type,
            self.column,
            self.method.as_str(),
            self.template
        )
    }
}

/// A requirement no declared index covers.
pub type IndexGap = IndexRequirement;

/// Index requirements of one descriptor.
///
/// Multi-owner predicates are OR'ed, which Postgres answers with a bitmap OR
/// over one index per column, so each column needs its own leading index.
pub fn requirements(descriptor: &ResourceDescriptor) -> Vec<IndexRequirement> {
    let template = descriptor.ownership.as_str();
    let require = |column: &str, method: IndexMethod| IndexRequirement {
        resource_type: descriptor.resource_type.clone(),
        column: column.to_string(),
        method,
        template,
    };

    match &descriptor.ownership {
        OwnershipTemplate::DirectOwner { owner_field } => {
            vec![require(owner_field, IndexMethod::Btree)]
        }
        OwnershipTemplate::MultiOwner { owner_fields } => owner_fields
            .iter()
            .map(|field| require(field, IndexMethod::Btree))
            .collect(),
        OwnershipTemplate::ParticipantSet { members_field } => {
            vec![require(members_field, IndexMethod::Gin)]
        }
        OwnershipTemplate::ParentOwned {
            reference_field, ..
        } => vec![require(reference_field, IndexMethod::Btree)],
        OwnershipTemplate::Catalog { .. } | OwnershipTemplate::ServiceOnly => Vec::new(),
    }
}

/// Requirements of `descriptors` that no index in `indexes` covers.
pub fn find_gaps<'a>(
    descriptors: impl IntoIterator<Item = &'a ResourceDescriptor>,
    indexes: &[IndexSpec],
) -> Vec<IndexGap> {
    descriptors
        .into_iter()
        .flat_map(requirements)
        .filter(|requirement| !indexes.iter().any(|index| index.covers(requirement)))
        .collect()
}

/// `CREATE INDEX` statement closing one gap.
pub fn render_ddl(gap: &IndexGap, schema: &str) -> String {
    let mut name = format!("idx_{}_{}", gap.resource_type, gap.column);
    name.truncate(63);
    format!(
        "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\".\"{}\" USING {} (\"{}\");",
        name,
        schema,
        gap.resource_type,
        gap.method.as_str(),
        gap.column
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ResourceDescriptor {
        ResourceDescriptor::new(
            "connection",
            OwnershipTemplate::MultiOwner {
                owner_fields: vec!["user_id".into(), "professional_id".into()],
            },
        )
    }

    #[test]
    fn test_multi_owner_needs_each_column_leading() {
        let composite = vec![IndexSpec::btree("connection", &["user_id", "professional_id"])];
        let gaps = find_gaps([&connection()], &composite);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].column, "professional_id");

        let separate = vec![
            IndexSpec::btree("connection", &["user_id"]),
            IndexSpec::btree("connection", &["professional_id", "created_at"]),
        ];
        assert!(find_gaps([&connection()], &separate).is_empty());
    }

    #[test]
    fn test_participant_set_needs_gin() {
        let room = ResourceDescriptor::new(
            "room",
            OwnershipTemplate::ParticipantSet {
                members_field: "participant_ids".into(),
            },
        );
        let btree = vec![IndexSpec::btree("room", &["participant_ids"])];
        let gaps = find_gaps([&room], &btree);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].method, IndexMethod::Gin);

        let gin = vec![IndexSpec::gin("room", "participant_ids")];
        assert!(find_gaps([&room], &gin).is_empty());
    }

    #[test]
    fn test_catalog_and_service_only_need_nothing() {
        let catalog = ResourceDescriptor::new(
            "exercise",
            OwnershipTemplate::Catalog {
                creator_field: "created_by".into(),
            },
        );
        let job = ResourceDescriptor::new("job", OwnershipTemplate::ServiceOnly);
        assert!(find_gaps([&catalog, &job], &[]).is_empty());
    }

    #[test]
    fn test_index_on_other_table_does_not_count() {
        let journal = ResourceDescriptor::direct_owner("journal", "user_id");
        let other = vec![IndexSpec::btree("conversation", &["user_id"])];
        assert_eq!(find_gaps([&journal], &other).len(), 1);
    }

    #[test]
    fn test_render_ddl() {
        let room = ResourceDescriptor::new(
            "room",
            OwnershipTemplate::ParticipantSet {
                members_field: "participant_ids".into(),
            },
        );
        let gaps = find_gaps([&room], &[]);
        assert_eq!(
            render_ddl(&gaps[0], "public"),
            "CREATE INDEX IF NOT EXISTS \"idx_room_participant_ids\" ON \"public\".\"room\" USING gin (\"participant_ids\");"
        );
        assert_eq!(
            gaps[0].to_string(),
            "room.participant_ids needs a gin index (participant_set)"
        );
    }
}
