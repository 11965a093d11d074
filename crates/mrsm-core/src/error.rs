//! Error taxonomy for mrsm (spec §7).

use thiserror::Error;

/// mrsm's error taxonomy. Every fallible public operation either returns
/// this directly or converts it into a [`crate::success::SuccessTuple`]
/// at the CLI/job boundary.
#[derive(Debug, Error)]
pub enum MrsmError {
    /// Bad or missing config/env. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backend refused or timed out. Retried at the pipeline level per
    /// policy, then surfaced.
    #[error("connector unavailable: {0}")]
    ConnectorUnavailable(String),

    /// Incoming dtype cannot coexist with the stored dtype under
    /// `static=true` or a forbidden widening. Fatal to that pipe's sync.
    #[error("schema conflict on column '{column}': {reason}")]
    SchemaConflict { column: String, reason: String },

    /// Coercion failed on a specific row/column.
    #[error("dtype mismatch on column '{column}': expected {expected}, got {actual}")]
    DtypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    /// Missing pipe/user/plugin.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Network blip, retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Cooperative cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A deadline elapsed before the operation finished.
    #[error("timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// Malformed schedule expression.
    #[error("invalid schedule expression '{0}': {1}")]
    InvalidSchedule(String, String),

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for backend driver errors not worth a dedicated variant.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for mrsm operations.
pub type Result<T> = std::result::Result<T, MrsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_mismatch_message_includes_column() {
        let err = MrsmError::DtypeMismatch {
            column: "foo".into(),
            expected: "int".into(),
            actual: "text".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("int"));
        assert!(msg.contains("text"));
    }

    #[test]
    fn already_exists_display() {
        let err = MrsmError::AlreadyExists("pipe foo/bar".into());
        assert!(err.to_string().contains("already exists"));
    }
}
