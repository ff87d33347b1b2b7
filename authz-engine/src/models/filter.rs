//! Residual row filters produced by collection reads.
//!
//! A filter is pushed down to the store instead of materialising every row
//! and checking each one. The Postgres adapter renders it to SQL; the
//! in-memory store evaluates it with [`RowFilter::matches`].

use serde_json::Value;

use super::descriptor::KeyType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `field = principal`
    OwnerEq { field: String, principal_id: String },
    /// `a = principal OR b = principal ...`
    AnyOwnerEq {
        fields: Vec<String>,
        principal_id: String,
    },
    /// `principal = ANY(field)`
    OwnerContains { field: String, principal_id: String },
    /// `reference_field IN (SELECT id FROM parent WHERE parent_filter)`
    ParentMatches {
        reference_field: String,
        parent_type: String,
        parent_id_field: String,
        parent_key_type: KeyType,
        parent_filter: Box<RowFilter>,
    },
    /// Caller-supplied equality on any column, compared as text.
    FieldEquals { field: String, value: String },
    All(Vec<RowFilter>),
}

impl RowFilter {
    pub fn field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        RowFilter::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction, flattening nested `All`s.
    pub fn and(self, other: RowFilter) -> RowFilter {
        let mut parts = match self {
            RowFilter::All(parts) => parts,
            single => vec![single],
        };
        match other {
            RowFilter::All(more) => parts.extend(more),
            single => parts.push(single),
        }
        RowFilter::All(parts)
    }

    /// Evaluate against a JSON row. `lookup(parent_type, id)` fetches parent
    /// rows for `ParentMatches`.
    pub fn matches<F>(&self, row: &Value, lookup: &F) -> bool
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        match self {
            RowFilter::OwnerEq {
                field,
                principal_id,
            } => field_key(row, field).as_deref() == Some(principal_id.as_str()),
            RowFilter::AnyOwnerEq {
                fields,
                principal_id,
            } => fields
                .iter()
                .any(|f| field_key(row, f).as_deref() == Some(principal_id.as_str())),
            RowFilter::OwnerContains {
                field,
                principal_id,
            } => match row.get(field) {
                Some(Value::Array(members)) => members
                    .iter()
                    .any(|m| owner_key(m).as_deref() == Some(principal_id.as_str())),
                _ => false,
            },
            RowFilter::ParentMatches {
                reference_field,
                parent_type,
                parent_filter,
                ..
            } => field_key(row, reference_field)
                .and_then(|id| lookup(parent_type, &id))
                .is_some_and(|parent| parent_filter.matches(&parent, lookup)),
            RowFilter::FieldEquals { field, value } => {
                row.get(field).and_then(scalar_text).as_deref() == Some(value.as_str())
            }
            RowFilter::All(parts) => parts.iter().all(|p| p.matches(row, lookup)),
        }
    }
}

/// Normalise an id-like JSON value to a string. Only strings and integers
/// count; null, objects, arrays and floats are never owner ids.
pub fn owner_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

pub fn field_key(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(owner_key)
}

/// Text form of a scalar, matching what Postgres yields for `column::text`.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
