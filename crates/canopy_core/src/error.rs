//! Error types for the sync engine.

use canopy_value::{Path, ValueError};
use thiserror::Error;

/// Result type for engine operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Why a transaction finished without committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A direct set touched an overlapping location.
    Set,
    /// A direct update touched an overlapping location.
    Update,
    /// An on-disconnect write touched an overlapping location.
    Disconnect,
    /// The retry bound was reached.
    MaxRetry,
    /// The update function returned no value.
    NoData,
    /// The update function returned invalid data.
    InvalidData(String),
    /// The server rejected the write with the given status.
    Server(String),
}

impl AbortReason {
    /// Wire string for the reason.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Set => "set",
            Self::Update => "update",
            Self::Disconnect => "disconnect",
            Self::MaxRetry => "maxretry",
            Self::NoData => "nodata",
            Self::InvalidData(_) => "invaliddata",
            Self::Server(status) => status,
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidData(reason) => write!(f, "invaliddata: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    /// A value, key, path or priority failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValueError),

    /// The remote authority rejected a request.
    #[error("{code}{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Server {
        /// Upper-cased status code.
        code: String,
        /// Optional human-readable reason.
        reason: Option<String>,
    },

    /// A listen was rejected or revoked by the remote authority.
    #[error("{code} at {path}: {message}")]
    ListenRevoked {
        /// Status code as received.
        code: String,
        /// Path of the revoked query.
        path: Path,
        /// Human-readable message.
        message: String,
    },

    /// A transaction finished without committing.
    #[error("transaction aborted: {0}")]
    TransactionAborted(AbortReason),

    /// Writes are not allowed under `.info`.
    #[error("path {0} is read-only")]
    ReadOnlyPath(Path),

    /// The engine dropped the completion before resolving it.
    #[error("engine disconnected before the operation completed")]
    Disconnected,
}

impl DatabaseError {
    /// Maps a non-ok write status to an error.
    pub fn server(status: &str, reason: Option<&str>) -> Self {
        Self::Server {
            code: status.to_uppercase(),
            reason: reason.map(str::to_string),
        }
    }

    /// Maps a failed listen status to a revocation error.
    pub fn listen_revoked(status: &str, path: &Path) -> Self {
        let message = match status {
            "permission_denied" => "Client doesn't have permission to access the desired data.",
            "unavailable" => "The service is unavailable",
            "too_big" => "The data requested exceeds the maximum size that can be accessed with a single request.",
            _ => "Unknown error",
        };
        Self::ListenRevoked {
            code: status.to_string(),
            path: path.clone(),
            message: message.to_string(),
        }
    }

    /// Returns the abort reason for aborted transactions.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Self::TransactionAborted(reason) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = DatabaseError::server("permission_denied", Some("nope"));
        assert_eq!(err.to_string(), "PERMISSION_DENIED: nope");
        let err = DatabaseError::server("expired_token", None);
        assert_eq!(err.to_string(), "EXPIRED_TOKEN");
    }

    #[test]
    fn abort_reason_wire_strings() {
        assert_eq!(AbortReason::MaxRetry.as_str(), "maxretry");
        assert_eq!(AbortReason::Server("disconnected".into()).as_str(), "disconnected");
        let err = DatabaseError::TransactionAborted(AbortReason::Set);
        assert_eq!(err.abort_reason(), Some(&AbortReason::Set));
        assert_eq!(err.to_string(), "transaction aborted: set");
    }

    #[test]
    fn listen_revoked_message() {
        let err = DatabaseError::listen_revoked("permission_denied", &Path::parse("a"));
        assert!(err.to_string().starts_with("permission_denied at /a:"));
    }

    #[test]
    fn from_value_error() {
        let err: DatabaseError = ValueError::invalid_key("a.b", "/").into();
        assert!(matches!(err, DatabaseError::Validation(_)));
    }
}
