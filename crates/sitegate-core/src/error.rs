//! Error types for rule management and persistence collaborators.

use thiserror::Error;

/// Configuration error raised by a rule-engine mutation.
///
/// A mutation that returns one of these leaves the engine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// An item with the same id already exists.
    #[error("{kind} '{id}' already exists")]
    Duplicate {
        /// Kind of item (rule, group, schedule).
        kind: &'static str,
        /// The conflicting id.
        id: String,
    },

    /// The referenced item does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Kind of item (rule, group, schedule).
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// The item is still referenced and cannot be removed.
    #[error("{kind} '{id}' is still referenced by rule '{by}'")]
    InUse {
        /// Kind of item (group, schedule).
        kind: &'static str,
        /// The referenced id.
        id: String,
        /// Id of a rule holding the reference.
        by: String,
    },
}

impl RuleError {
    /// Creates an invalid-field error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Returns the offending field, if the error concerns a single field.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            RuleError::InvalidField { field, .. } => Some(field),
            RuleError::Duplicate { .. } | RuleError::NotFound { .. } => Some("id"),
            RuleError::InUse { .. } => None,
        }
    }
}

/// Failure reported by a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    /// Creates a store error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// Result type for rule mutations.
pub type Result<T> = std::result::Result<T, RuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_field_reports_field() {
        let err = RuleError::invalid("pattern", "must not be empty");
        assert_eq!(err.field(), Some("pattern"));
        assert_eq!(err.to_string(), "invalid pattern: must not be empty");
    }

    #[test]
    fn duplicate_points_at_id() {
        let err = RuleError::Duplicate {
            kind: "rule",
            id: "r1".to_string(),
        };
        assert_eq!(err.field(), Some("id"));
        assert_eq!(err.to_string(), "rule 'r1' already exists");
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::new("disk full");
        assert_eq!(err.to_string(), "store error: disk full");
    }
}
