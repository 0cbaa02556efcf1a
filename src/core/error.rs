//! Typed errors for failure modes callers need to branch on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

/// Errors from the build task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Contention or connectivity problem; the operation may be retried.
    #[error("transient store failure: {message}")]
    Transient { message: String },

    /// Non-recoverable backend failure.
    #[error("store failure: {message}")]
    Backend { message: String },

    /// A stored record could not be decoded.
    #[error("malformed {kind} record {id}: {message}")]
    Malformed {
        kind: &'static str,
        id: i64,
        message: String,
    },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn malformed(kind: &'static str, id: i64, message: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            id,
            message: message.into(),
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
            Self::transient(err.to_string())
        } else if err.is_connection_refusal() {
            Self::transient(format!("connection refused: {err}"))
        } else {
            Self::backend(err.to_string())
        }
    }
}

/// Invalid grading or sandbox configuration. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("unsupported {kind}: {name}")]
    Unsupported { kind: &'static str, name: String },

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("project file {filename:?} could not be read: {reason}")]
    UnreadableProjectFile { filename: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// A checked external command exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("command {argv:?} exited with status {status}\n{output}")]
pub struct CommandFailed {
    pub argv: Vec<String>,
    pub status: i32,
    pub output: String,
}
