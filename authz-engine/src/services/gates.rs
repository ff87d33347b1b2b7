//! Capability gates consulted before ownership.
//!
//! Each gate is a separate predicate so that service bypass and facilitator
//! oversight can be revoked, reviewed and tested independently.

use crate::models::{Capability, Operation, Principal, PrincipalKind, ResourceDescriptor};

/// Unconditional access for internally issued principals.
pub struct ServiceBypass;

impl ServiceBypass {
    /// Keyed on the principal kind. No combination of user capabilities
    /// reaches this path.
    pub fn applies(principal: &Principal) -> bool {
        principal.kind() == PrincipalKind::Service && principal.has_capability(Capability::Service)
    }
}

/// Read-only cross-tenant oversight.
pub struct FacilitatorGate;

impl FacilitatorGate {
    pub fn grants(
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        operation: Operation,
    ) -> bool {
        principal.kind() == PrincipalKind::User
            && principal.has_capability(Capability::Facilitator)
            && descriptor.facilitator_visible
            && operation == Operation::Read
    }
}
