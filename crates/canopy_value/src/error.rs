//! Error types for the value crate.

use thiserror::Error;

/// Result type for value operations.
pub type ValueResult<T> = Result<T, ValueError>;

/// Errors raised while validating or converting values at the API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A child key is empty or contains a forbidden character.
    #[error("invalid key ({key}) at {path}: keys must be non-empty strings and can't contain \".\", \"#\", \"$\", \"/\", \"[\", or \"]\"")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Location of the key.
        path: String,
    },

    /// A path string contains a forbidden character.
    #[error("invalid path ({path}): paths can't contain \".\", \"#\", \"$\", \"[\", or \"]\"")]
    InvalidPath {
        /// The offending path string.
        path: String,
    },

    /// A priority is not null, a string, a finite number or a server value.
    #[error("invalid priority at {path}: must be a string, finite number, server value, or null")]
    InvalidPriority {
        /// Location of the priority.
        path: String,
    },

    /// Structural problem with a value.
    #[error("invalid data at {path}: {reason}")]
    InvalidData {
        /// Location of the problem.
        path: String,
        /// Description of the problem.
        reason: String,
    },

    /// A string leaf exceeds the maximum leaf size.
    #[error("string at {path} is larger than {limit} utf8 bytes")]
    LeafTooLarge {
        /// Location of the leaf.
        path: String,
        /// Maximum allowed size in bytes.
        limit: usize,
    },

    /// Two update paths overlap.
    #[error("update path {ancestor} is an ancestor of another update path {descendant}")]
    OverlappingPaths {
        /// The ancestor path.
        ancestor: String,
        /// The descendant path.
        descendant: String,
    },

    /// An unknown server value placeholder.
    #[error("unsupported server value at {path}: {value}")]
    UnsupportedServerValue {
        /// Location of the placeholder.
        path: String,
        /// The placeholder as JSON.
        value: String,
    },
}

impl ValueError {
    /// Create an invalid data error.
    pub fn invalid_data(path: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, path: impl ToString) -> Self {
        Self::InvalidKey {
            key: key.into(),
            path: path.to_string(),
        }
    }
}
