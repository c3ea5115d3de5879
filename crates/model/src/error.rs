//! Error types shared by the engine and its backends.

use thiserror::Error;

/// Error type covering every failure a vault operation can surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    // Permission errors
    /// The actor lacks the permission for this operation. Callers re-derive
    /// permissions instead of retrying.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The identity's session is no longer valid on the remote side.
    #[error("session expired: {0}")]
    SessionExpired(String),

    // Lookup errors
    /// The requested entity does not exist. Terminal.
    #[error("not found: {0}")]
    NotFound(String),

    // Remote errors
    /// A network call failed in a way that may succeed if repeated.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Some items of a batch failed; the whole batch is treated as failed.
    #[error("{failed} of {total} items failed: {reason}")]
    PartialFailure {
        /// Number of failed items.
        failed: usize,
        /// Number of items in the batch.
        total: usize,
        /// First failure reason.
        reason: String,
    },

    /// A uniqueness constraint rejected an insert.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store rejected the request.
    #[error("storage error: {0}")]
    Storage(String),

    // Local errors
    /// The caller supplied an unusable value.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl VaultError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Whether callers absorb this error instead of reporting it.
    pub fn is_swallowed(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the error concerns the actor's permissions or session.
    pub fn is_permission_boundary(&self) -> bool {
        matches!(self, Self::AccessDenied(_) | Self::SessionExpired(_))
    }
}

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => VaultError::TransientNetwork(err.to_string()),
            ErrorKind::NotFound => VaultError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => VaultError::AccessDenied(err.to_string()),
            _ => VaultError::Storage(err.to_string()),
        }
    }
}

/// Tagged outcome of a lookup that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Error(String),
}

impl<T> Lookup<T> {
    /// Folds a fallible optional lookup into a tagged result.
    pub fn from_result(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Self::Found(value),
            Ok(None) | Err(VaultError::NotFound(_)) => Self::NotFound,
            Err(err) => Self::Error(err.to_string()),
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
            Self::Error(reason) => Lookup::Error(reason),
        }
    }
}
