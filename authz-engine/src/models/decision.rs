//! Operations and decisions.

use serde::{Deserialize, Serialize};

use super::filter::RowFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Operation::Read),
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Read)
    }

    pub fn is_write(&self) -> bool {
        !self.is_read()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a decision denied. Internal only: logged and asserted in tests, never
/// shown to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    /// Policy evaluated and rejected (includes closed-world default deny).
    Policy,
    /// The resource type has no descriptor.
    Misconfigured,
    /// A parent-owned row's parent could not be resolved.
    ParentUnresolvable,
    /// The resource type lives in the restricted namespace.
    Isolated,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Policy => "policy",
            DenyReason::Misconfigured => "misconfigured",
            DenyReason::ParentUnresolvable => "parent_unresolvable",
            DenyReason::Isolated => "isolated",
        }
    }
}

/// Result of one policy evaluation. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    AllowWithFilter(RowFilter),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !self.is_denied()
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Deny(_))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Deny(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn filter(&self) -> Option<&RowFilter> {
        match self {
            Decision::AllowWithFilter(filter) => Some(filter),
            _ => None,
        }
    }

    /// Low-cardinality label for metrics and logs.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::AllowWithFilter(_) => "allow_with_filter",
            Decision::Deny(DenyReason::Policy) => "deny_policy",
            Decision::Deny(DenyReason::Misconfigured) => "deny_misconfigured",
            Decision::Deny(DenyReason::ParentUnresolvable) => "deny_parent_unresolvable",
            Decision::Deny(DenyReason::Isolated) => "deny_isolated",
        }
    }
}

/// User-visible form: the reason never appears.
impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::AllowWithFilter(_) => write!(f, "allow-with-filter"),
            Decision::Deny(_) => write!(f, "deny"),
        }
    }
}
