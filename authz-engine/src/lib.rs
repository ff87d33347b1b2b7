//! authz-engine: row-level, multi-tenant authorization.
//!
//! Requests carry a [`models::Principal`]; each resource type has a
//! [`models::ResourceDescriptor`] naming its ownership template. The
//! [`engine::AuthzEngine`] decides every read and write against those
//! descriptors, pushes ownership down to the store as a residual filter for
//! collection reads, and records a hash-chained audit entry in the same
//! transaction as every allowed mutation.

pub mod config;
pub mod engine;
pub mod models;
pub mod services;
pub mod store;

pub use engine::{AuthzEngine, Candidate, MutationOutcome};
