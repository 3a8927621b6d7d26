//! Error types for identity parsing.

use thiserror::Error;

/// Errors that can occur when parsing identifiers, names or addresses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an unexpected prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The component kind is not one this operator manages.
    #[error("unknown component kind: {0}")]
    UnknownComponent(String),

    /// A pod name does not follow `{cluster}-{kind}-{ordinal}`.
    #[error("invalid member name '{name}': {reason}")]
    InvalidMemberName { name: String, reason: &'static str },

    /// A member address could not be parsed.
    #[error("invalid member address '{0}'")]
    InvalidAddress(String),
}

impl IdError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
