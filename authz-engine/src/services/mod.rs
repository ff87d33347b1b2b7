//! Services layer for authz-engine.
//!
//! Policy evaluation and its gates, ownership classification, audit
//! recording, the restricted-namespace boundary, index advice and the
//! descriptor registry.

pub mod audit;
pub mod classifier;
pub mod error;
pub mod evaluator;
pub mod gates;
pub mod index_advisor;
pub mod isolation;
pub mod metrics;
pub mod registry;
pub mod resolver;

pub use audit::{compute_entry_hash, verify_chain, AuditEvent, AuditRecorder, ChainError};
pub use classifier::{OwnerSet, OwnershipClassifier, ParentLookup, StoreLookup, TxLookup};
pub use error::{AuthzError, RegistryError};
pub use evaluator::PolicyEvaluator;
pub use gates::{FacilitatorGate, ServiceBypass};
pub use index_advisor::{
    find_gaps, render_ddl, requirements, IndexGap, IndexMethod, IndexRequirement, IndexSpec,
};
pub use isolation::{
    AccessGrant, IsolationBoundary, ProjectionAccessor, ProjectionAccessorConfig,
    RestrictedAccessor,
};
pub use registry::{DescriptorRegistry, DescriptorSet, RegistryBuilder};
pub use resolver::{
    Credential, JwtAlgorithm, JwtPrincipalResolver, JwtResolverConfig, PrincipalClaims,
    PrincipalResolver, TokenUse,
};
