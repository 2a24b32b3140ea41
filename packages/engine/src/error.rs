//! Engine error taxonomy.
//!
//! Errors are grouped by cause: transient (version conflicts, timeouts),
//! user (invalid inputs, failed transforms), absence (`NotFound`), and
//! terminal (`Closed`). Cache misses never escape the engine; internal
//! broadcaster failures are logged, not surfaced.

use vellum_core::diff::DiffError;

use crate::cache::CacheError;

/// Errors returned by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No document exists under the requested id.
    #[error("document {id} not found")]
    NotFound {
        /// Rendered document id.
        id: String,
    },

    /// A conditional update matched nothing: the stored version moved
    /// underneath the caller.
    #[error("version mismatch on {id}: expected {expected}, observed {observed}")]
    VersionMismatch {
        /// Rendered document id.
        id: String,
        /// Version the update was conditioned on.
        expected: i64,
        /// Version observed in the store afterwards (0 when the document
        /// is gone or unreadable).
        observed: i64,
        /// Optional section path, for stores that version document
        /// sections independently.
        section: Option<String>,
    },

    /// The supplied document is not storable.
    #[error("invalid document: {reason}")]
    InvalidDocument {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// The operation exceeded its configured timeout, retries included.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Effective timeout bound in milliseconds.
        timeout_ms: u64,
    },

    /// The retry budget ran out before the operation could commit.
    #[error("gave up after {retries} retries")]
    MaxRetriesExceeded {
        /// Number of retries performed.
        retries: u32,
        /// The conflict that exhausted the budget.
        #[source]
        source: Box<EngineError>,
    },

    /// The engine (or a resource it depends on) has been closed.
    #[error("engine is closed")]
    Closed,

    /// The options carry no version-field name.
    #[error("options do not name a version field")]
    MissingVersionField,

    /// A section-addressed operation named a section the document lacks.
    #[error("section {path} not found")]
    SectionNotFound {
        /// Dotted section path.
        path: String,
    },

    /// A store-level multi-operation session failed.
    #[error("transaction failed: {reason}")]
    TransactionFailed {
        /// Backend-reported reason.
        reason: String,
    },

    /// The caller-supplied transform rejected the document.
    #[error("transform failed")]
    TransformFailed {
        /// The transform's error.
        #[source]
        source: anyhow::Error,
    },

    /// Watch was requested but the engine was configured without it.
    #[error("watch is disabled by configuration")]
    WatchDisabled,

    /// A cache operation failed in a position where it is fatal.
    #[error("cache error")]
    Cache(#[from] CacheError),

    /// Diffing the transformed document failed.
    #[error("diff error")]
    Diff(#[from] DiffError),

    /// The backing store reported an error.
    #[error("store error")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// True for version-conflict errors, including a retry exhaustion that
    /// wraps one. `VersionMismatch` is an instance of the version-conflict
    /// family for `is-a` checks.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        match self {
            Self::VersionMismatch { .. } => true,
            Self::MaxRetriesExceeded { source, .. } => source.is_version_conflict(),
            _ => false,
        }
    }

    /// True for errors a caller may reasonably retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. } | Self::Timeout { .. } | Self::MaxRetriesExceeded { .. }
        ) || matches!(self, Self::Cache(CacheError::Full))
    }

    /// True when the error reports document absence.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch() -> EngineError {
        EngineError::VersionMismatch {
            id: "doc-1".to_string(),
            expected: 3,
            observed: 5,
            section: None,
        }
    }

    #[test]
    fn version_mismatch_is_a_version_conflict() {
        assert!(mismatch().is_version_conflict());
    }

    #[test]
    fn retry_exhaustion_wrapping_a_mismatch_is_a_version_conflict() {
        let err = EngineError::MaxRetriesExceeded {
            retries: 4,
            source: Box::new(mismatch()),
        };
        assert!(err.is_version_conflict());
        assert!(err.is_transient());
    }

    #[test]
    fn retry_exhaustion_wrapping_something_else_is_not() {
        let err = EngineError::MaxRetriesExceeded {
            retries: 4,
            source: Box::new(EngineError::Closed),
        };
        assert!(!err.is_version_conflict());
    }

    #[test]
    fn absence_and_terminal_errors_are_not_transient() {
        assert!(!EngineError::NotFound { id: "x".into() }.is_transient());
        assert!(!EngineError::Closed.is_transient());
        assert!(EngineError::NotFound { id: "x".into() }.is_not_found());
    }

    #[test]
    fn messages_name_the_offending_parts() {
        assert_eq!(mismatch().to_string(), "version mismatch on doc-1: expected 3, observed 5");
        assert_eq!(
            EngineError::Timeout { timeout_ms: 50 }.to_string(),
            "operation timed out after 50ms"
        );
    }
}
