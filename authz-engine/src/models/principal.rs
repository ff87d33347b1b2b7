//! Principal model - the authenticated caller of a single request.
//!
//! A principal is built once per request by a resolver and passed by value
//! through evaluation. It is never persisted here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability flags a principal may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Read-only cross-tenant oversight.
    Facilitator,
    /// Internal system process; bypasses ownership entirely.
    Service,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Facilitator => "facilitator",
            Capability::Service => "service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "facilitator" => Some(Capability::Facilitator),
            "service" => Some(Capability::Service),
            _ => None,
        }
    }
}

/// How the principal was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Service,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Service => "service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(PrincipalKind::User),
            "service" => Some(PrincipalKind::Service),
            _ => None,
        }
    }
}

/// Authenticated caller: an opaque id plus capability flags.
///
/// User principals can only ever hold `facilitator`; service principals hold
/// exactly `service`. There is no setter that moves a principal between kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    id: String,
    kind: PrincipalKind,
    capabilities: BTreeSet<Capability>,
}

impl Principal {
    /// An end user with no special capabilities.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::User,
            capabilities: BTreeSet::new(),
        }
    }

    /// An end user holding the facilitator capability.
    pub fn facilitator(id: impl Into<String>) -> Self {
        Self::user(id).with_facilitator()
    }

    /// An internally issued system principal. Never construct this from an
    /// externally supplied credential.
    pub fn service(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Service,
            capabilities: BTreeSet::from([Capability::Service]),
        }
    }

    /// Same user, with facilitator added. No-op for service principals.
    pub fn with_facilitator(mut self) -> Self {
        if self.kind == PrincipalKind::User {
            self.capabilities.insert(Capability::Facilitator);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facilitator_never_grants_service() {
        let p = Principal::facilitator("u1");
        assert!(p.has_capability(Capability::Facilitator));
        assert!(!p.has_capability(Capability::Service));
        assert_eq!(p.kind(), PrincipalKind::User);
    }

    #[test]
    fn test_service_cannot_gain_facilitator() {
        let p = Principal::service("svc").with_facilitator();
        assert!(p.has_capability(Capability::Service));
        assert!(!p.has_capability(Capability::Facilitator));
    }

    #[test]
    fn test_parse_capability() {
        assert_eq!(Capability::parse("Facilitator"), Some(Capability::Facilitator));
        assert_eq!(Capability::parse("admin"), None);
    }
}
