//! Error taxonomy for patchctl.
//!
//! Patch execution and consolidation capture most of these into their result
//! structures instead of returning them; only precondition failures unwind
//! past those boundaries.

/// patchctl errors.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("git {command} failed (exit {exit_code:?}): {stderr}")]
    Git {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("validation '{name}' failed: {details}")]
    Validation { name: String, details: String },

    #[error("patch operation failed: {0}")]
    Operation(String),

    #[error("filesystem operation on {path} failed: {reason}")]
    FileSystem { path: String, reason: String },

    #[error("duplicate detection failed: {0}")]
    DuplicateDetection(String),

    #[error("issue tracker error (status {status:?}): {message}")]
    Tracker { status: Option<u16>, message: String },

    #[error("{what} timed out after {limit_secs}s")]
    Timeout { what: String, limit_secs: u64 },

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("not a git repository: {0}")]
    NotARepository(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    /// Build a [`PatchError::FileSystem`] from a path and any displayable cause.
    pub fn fs(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        PatchError::FileSystem {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from a deadline or cancellation rather than
    /// the command itself.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PatchError::Timeout { .. } | PatchError::Cancelled(_))
    }
}

/// Result type for patchctl operations.
pub type Result<T> = std::result::Result<T, PatchError>;
