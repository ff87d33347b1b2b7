use service_core::error::AppError;
use thiserror::Error;

use crate::services::index_advisor::IndexGap;
use crate::store::StoreError;

/// Request-time failures.
///
/// `Unauthenticated`, `Denied` and `ParentUnresolvable` are expected
/// outcomes; callers must not be able to tell a missing row from an unowned
/// one. `Misconfigured` and `StoreUnavailable` are operational.
#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    #[error("Access denied")]
    Denied,

    #[error("Parent of {resource_type} ({parent_type}) could not be resolved")]
    ParentUnresolvable {
        resource_type: String,
        parent_type: String,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AuthzError {
    /// Label for the `authz_errors_total` metric.
    pub fn error_type(&self) -> &'static str {
        match self {
            AuthzError::Unauthenticated(_) => "unauthenticated",
            AuthzError::Misconfigured(_) => "misconfigured",
            AuthzError::Denied => "denied",
            AuthzError::ParentUnresolvable { .. } => "parent_unresolvable",
            AuthzError::StoreUnavailable(_) => "store_unavailable",
            AuthzError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether operators need to hear about it.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            AuthzError::Misconfigured(_) | AuthzError::StoreUnavailable(_)
        )
    }

    /// Store failures caused by the request itself become `InvalidRequest`;
    /// everything else means the store is unavailable.
    pub fn from_store(err: StoreError) -> Self {
        if err.is_caller_error() {
            AuthzError::InvalidRequest(err.to_string())
        } else {
            AuthzError::StoreUnavailable(err)
        }
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Unauthenticated(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            AuthzError::Misconfigured(e) => AppError::ConfigError(anyhow::anyhow!(e)),
            AuthzError::Denied | AuthzError::ParentUnresolvable { .. } => {
                AppError::Forbidden(anyhow::anyhow!("Access denied"))
            }
            AuthzError::StoreUnavailable(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            AuthzError::InvalidRequest(e) => AppError::BadRequest(anyhow::anyhow!(e)),
        }
    }
}

/// Descriptor set rejected while building the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to load descriptors: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid identifier '{identifier}' in descriptor for {resource_type}")]
    InvalidIdentifier {
        resource_type: String,
        identifier: String,
    },

    #[error("Resource type {0} is registered twice")]
    DuplicateResource(String),

    #[error("Resource type {0} declares no owner fields")]
    EmptyOwnerFields(String),

    #[error("Resource type {resource_type} references unknown parent {parent_type}")]
    UnknownParent {
        resource_type: String,
        parent_type: String,
    },

    #[error(
        "Resource type {resource_type} inherits from {parent_type}, whose template {template} has no row owners"
    )]
    InvalidParentTemplate {
        resource_type: String,
        parent_type: String,
        template: String,
    },

    #[error("Owner predicates are not indexed: {}", format_gaps(.0))]
    UnindexedPredicates(Vec<IndexGap>),

    #[error("Accessor {0} is registered twice")]
    DuplicateAccessor(String),

    #[error("Accessor {accessor} is invalid: {reason}")]
    InvalidAccessor { accessor: String, reason: String },
}

fn format_gaps(gaps: &[IndexGap]) -> String {
    gaps.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}
