//! Restricted-namespace accessors.
//!
//! Resource types in the restricted namespace back risky capabilities and
//! are denied on every principal-scoped engine path. The only way in is a
//! registered accessor: it runs its own authorization against the caller
//! and hands back a minimal projection, never the raw rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Principal, ResourceDescriptor, RowFilter};
use crate::services::error::AuthzError;
use crate::services::gates::ServiceBypass;
use crate::services::metrics::ACCESSOR_CALLS_TOTAL;
use crate::store::Store;

/// Proof that an accessor's own check passed. `fetch` only runs with one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub subject_id: String,
    pub filter: RowFilter,
}

impl AccessGrant {
    pub fn new(subject_id: impl Into<String>, filter: RowFilter) -> Self {
        Self {
            subject_id: subject_id.into(),
            filter,
        }
    }
}

#[async_trait]
pub trait RestrictedAccessor: Send + Sync {
    fn name(&self) -> &str;

    /// Restricted resource type this accessor fronts.
    fn resource_type(&self) -> &str;

    /// Columns the accessor filters on or returns. Checked as identifiers
    /// when the registry is built.
    fn columns(&self) -> Vec<&str> {
        Vec::new()
    }

    /// Explicit authorization for this call. Namespace placement grants
    /// nothing by itself.
    fn authorize(&self, principal: &Principal, args: &Value) -> Result<AccessGrant, AuthzError>;

    /// Read and shape the result.
    async fn fetch(
        &self,
        grant: &AccessGrant,
        descriptor: &ResourceDescriptor,
        store: &dyn Store,
    ) -> Result<Value, AuthzError>;
}

/// Declarative accessor: rows whose `owner_field` equals the caller,
/// projected to `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionAccessorConfig {
    pub name: String,
    pub resource_type: String,
    pub owner_field: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub max_rows: Option<usize>,
}

pub struct ProjectionAccessor {
    config: ProjectionAccessorConfig,
}

impl ProjectionAccessor {
    pub fn new(config: ProjectionAccessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProjectionAccessorConfig {
        &self.config
    }

    fn project(&self, row: &Value) -> Value {
        let mut shaped = Map::new();
        for field in &self.config.fields {
            if let Some(value) = row.get(field) {
                shaped.insert(field.clone(), value.clone());
            }
        }
        Value::Object(shaped)
    }
}

#[async_trait]
impl RestrictedAccessor for ProjectionAccessor {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn resource_type(&self) -> &str {
        &self.config.resource_type
    }

    fn columns(&self) -> Vec<&str> {
        std::iter::once(self.config.owner_field.as_str())
            .chain(self.config.fields.iter().map(String::as_str))
            .collect()
    }

    /// Users only ever see their own rows. Service principals must name the
    /// subject they act for with `owner_id`. Other arguments are equality
    /// filters on projected fields.
    fn authorize(&self, principal: &Principal, args: &Value) -> Result<AccessGrant, AuthzError> {
        let args = match args {
            Value::Null => Map::new(),
            Value::Object(args) => args.clone(),
            _ => {
                return Err(AuthzError::InvalidRequest(
                    "accessor arguments must be an object".to_string(),
                ))
            }
        };

        let requested_owner = match args.get("owner_id") {
            None => None,
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(_) => {
                return Err(AuthzError::InvalidRequest(
                    "owner_id must be a non-empty string".to_string(),
                ))
            }
        };

        let subject_id = if ServiceBypass::applies(principal) {
            requested_owner.ok_or_else(|| {
                AuthzError::InvalidRequest("service callers must pass owner_id".to_string())
            })?
        } else {
            match requested_owner {
                Some(owner) if owner != principal.id() => return Err(AuthzError::Denied),
                _ => principal.id().to_string(),
            }
        };

        let mut filter = RowFilter::OwnerEq {
            field: self.config.owner_field.clone(),
            principal_id: subject_id.clone(),
        };
        for (key, value) in args.iter().filter(|(key, _)| key.as_str() != "owner_id") {
            if !self.config.fields.contains(key) {
                return Err(AuthzError::InvalidRequest(format!(
                    "{} cannot filter on '{}'",
                    self.config.name, key
                )));
            }
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(AuthzError::InvalidRequest(format!(
                        "filter '{}' must be a scalar",
                        key
                    )))
                }
            };
            filter = filter.and(RowFilter::field_equals(key.clone(), value));
        }

        Ok(AccessGrant::new(subject_id, filter))
    }

    async fn fetch(
        &self,
        grant: &AccessGrant,
        descriptor: &ResourceDescriptor,
        store: &dyn Store,
    ) -> Result<Value, AuthzError> {
        let rows = match self.config.max_rows {
            Some(limit) => store.query_limited(descriptor, Some(&grant.filter), limit).await,
            None => store.query(descriptor, Some(&grant.filter)).await,
        }
        .map_err(AuthzError::from_store)?;
        Ok(Value::Array(rows.iter().map(|row| self.project(row)).collect()))
    }
}

struct Registered {
    accessor: Arc<dyn RestrictedAccessor>,
    descriptor: ResourceDescriptor,
}

/// The registered accessors, each paired with the restricted descriptor it
/// fronts.
#[derive(Default)]
pub struct IsolationBoundary {
    accessors: BTreeMap<String, Registered>,
}

impl IsolationBoundary {
    pub(crate) fn insert(
        &mut self,
        accessor: Arc<dyn RestrictedAccessor>,
        descriptor: ResourceDescriptor,
    ) {
        self.accessors.insert(
            accessor.name().to_string(),
            Registered {
                accessor,
                descriptor,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.accessors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.accessors.keys().map(String::as_str)
    }

    /// Run an accessor. An unknown name is a denial, so callers cannot probe
    /// which accessors exist.
    pub async fn invoke(
        &self,
        principal: &Principal,
        name: &str,
        args: &Value,
        store: &dyn Store,
    ) -> Result<Value, AuthzError> {
        let Some(registered) = self.accessors.get(name) else {
            warn!(principal = %principal.id(), accessor = %name, "Unknown accessor");
            ACCESSOR_CALLS_TOTAL
                .with_label_values(&["unknown", "denied"])
                .inc();
            return Err(AuthzError::Denied);
        };

        let result = match registered.accessor.authorize(principal, args) {
            Ok(grant) => {
                registered
                    .accessor
                    .fetch(&grant, &registered.descriptor, store)
                    .await
            }
            Err(err) => Err(err),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AuthzError::Denied) => "denied",
            Err(_) => "error",
        };
        ACCESSOR_CALLS_TOTAL
            .with_label_values(&[name, outcome])
            .inc();
        info!(
            principal = %principal.id(),
            principal_kind = principal.kind().as_str(),
            accessor = %name,
            resource_type = %registered.descriptor.resource_type,
            outcome = outcome,
            "Restricted accessor invoked"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accessor() -> ProjectionAccessor {
        ProjectionAccessor::new(ProjectionAccessorConfig {
            name: "my_egress_targets".into(),
            resource_type: "egress_target".into(),
            owner_field: "user_id".into(),
            fields: vec!["label".into(), "status".into()],
            max_rows: Some(10),
        })
    }

    #[test]
    fn test_user_is_scoped_to_self() {
        let grant = accessor()
            .authorize(&Principal::user("a"), &Value::Null)
            .unwrap();
        assert_eq!(grant.subject_id, "a");
        assert_eq!(
            grant.filter,
            RowFilter::OwnerEq {
                field: "user_id".into(),
                principal_id: "a".into(),
            }
        );
    }

    #[test]
    fn test_user_cannot_name_another_owner() {
        let err = accessor()
            .authorize(&Principal::facilitator("a"), &json!({"owner_id": "b"}))
            .unwrap_err();
        assert!(matches!(err, AuthzError::Denied));
    }

    #[test]
    fn test_service_must_name_subject() {
        let err = accessor()
            .authorize(&Principal::service("worker"), &json!({}))
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidRequest(_)));

        let grant = accessor()
            .authorize(&Principal::service("worker"), &json!({"owner_id": "b"}))
            .unwrap();
        assert_eq!(grant.subject_id, "b");
    }

    #[test]
    fn test_filters_limited_to_projected_fields() {
        let err = accessor()
            .authorize(&Principal::user("a"), &json!({"secret_url": "x"}))
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidRequest(_)));

        let grant = accessor()
            .authorize(&Principal::user("a"), &json!({"status": "active"}))
            .unwrap();
        assert!(matches!(grant.filter, RowFilter::All(ref parts) if parts.len() == 2));
    }

    #[test]
    fn test_projection_drops_unlisted_fields() {
        let shaped = accessor().project(&json!({
            "label": "crm",
            "status": "active",
            "url": "https://internal",
            "api_key": "k"
        }));
        assert_eq!(shaped, json!({"label": "crm", "status": "active"}));
    }
}
