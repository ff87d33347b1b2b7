//! Domain models for the authorization engine.

mod audit_entry;
mod decision;
mod descriptor;
mod filter;
mod principal;

pub use audit_entry::{AuditEntry, AuditLink};
pub use decision::{Decision, DenyReason, Operation};
pub use descriptor::{is_valid_identifier, KeyType, Namespace, OwnershipTemplate, ResourceDescriptor};
pub use filter::{field_key, owner_key, RowFilter};
pub use principal::{Capability, Principal, PrincipalKind};
