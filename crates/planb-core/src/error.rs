//! Error types for PlanB operations
//!
//! All PlanB errors are represented by the [`PlanBError`] enum. Errors are
//! `Clone` so that a single failed commit can be reported to every
//! submitter whose work was part of the aborted transaction.

use std::path::PathBuf;

use thiserror::Error;

/// Broad error classes used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Incompatible schema, oversized value, bad configuration. Not retryable.
    Configuration,
    /// Engine or I/O failure. The writer recovers with a fresh transaction.
    Transient,
    /// Missing lookup rows or broken invariants. Never silently defaulted.
    Corruption,
    /// Operation attempted after shutdown started, or against a read-only env.
    Lifecycle,
}

/// PlanB error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum PlanBError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The LMDB engine reported an error
    #[error("LMDB error: {message}")]
    Lmdb {
        /// Rendered engine error
        message: String,
    },

    /// An encoded value is larger than the codec or table allows
    #[error("{component} too large: {size} bytes exceeds limit of {max} bytes")]
    SizeExceeded {
        /// What was being encoded (key, value, uid lookup payload)
        component: String,
        /// Encoded size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Persisted schema descriptor differs from the expected one
    #[error("schema mismatch for {store}: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Store being opened or merged
        store: String,
        /// Descriptor this process expects
        expected: String,
        /// Descriptor found on disk
        found: String,
    },

    /// A lookup id has no backing row
    #[error("lookup id {id} has no row in table '{table}'")]
    MissingLookup {
        /// Lookup table name
        table: String,
        /// Hex rendering of the id bytes
        id: String,
    },

    /// A value could not be converted to the type a codec requires
    #[error("cannot encode {found} value as {expected}")]
    TypeMismatch {
        /// Codec type
        expected: &'static str,
        /// Type name of the supplied value
        found: &'static str,
    },

    /// Unsigned value does not fit the configured byte width
    #[error("value {value} does not fit in {width} unsigned bytes")]
    ValueOutOfRange {
        /// Value being encoded
        value: i128,
        /// Configured byte width
        width: u8,
    },

    /// Stored bytes could not be decoded
    #[error("corrupt {component}: {reason}")]
    Corrupt {
        /// What was being decoded
        component: String,
        /// Description of the problem
        reason: String,
    },

    /// A named database was expected but not found
    #[error("database '{name}' not found in {}", .path.display())]
    MissingDatabase {
        /// Database name
        name: String,
        /// Environment path
        path: PathBuf,
    },

    /// The writer no longer accepts work
    #[error("writer for {store} is shutting down")]
    ShuttingDown {
        /// Store name
        store: String,
    },

    /// The writer thread went away before replying
    #[error("writer for {store} terminated")]
    WriterClosed {
        /// Store name
        store: String,
    },

    /// Mutation attempted on an environment opened read-only
    #[error("environment {} is read only", .path.display())]
    ReadOnly {
        /// Environment path
        path: PathBuf,
    },

    /// The open transaction was discarded because another action failed
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Rendering of the error that caused the abort
        reason: String,
    },

    /// The engine failed to commit
    #[error("commit failed: {reason}")]
    CommitFailed {
        /// Rendered engine error
        reason: String,
    },

    /// Internal invariant broken
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Configuration rejected by `validate()`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PlanBError {
    /// Map this error onto the retry taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PlanBError::SizeExceeded { .. }
            | PlanBError::SchemaMismatch { .. }
            | PlanBError::TypeMismatch { .. }
            | PlanBError::ValueOutOfRange { .. }
            | PlanBError::InvalidConfig(_) => ErrorCategory::Configuration,
            PlanBError::Io { .. }
            | PlanBError::Lmdb { .. }
            | PlanBError::TransactionAborted { .. }
            | PlanBError::CommitFailed { .. } => ErrorCategory::Transient,
            PlanBError::MissingLookup { .. }
            | PlanBError::Corrupt { .. }
            | PlanBError::MissingDatabase { .. }
            | PlanBError::InvariantViolation(_) => ErrorCategory::Corruption,
            PlanBError::ShuttingDown { .. }
            | PlanBError::WriterClosed { .. }
            | PlanBError::ReadOnly { .. } => ErrorCategory::Lifecycle,
        }
    }

    /// Attach a path to an `Io` error that was converted without one.
    pub fn with_path(self, at: impl Into<PathBuf>) -> Self {
        match self {
            PlanBError::Io { path: None, kind, message } => PlanBError::Io {
                path: Some(at.into()),
                kind,
                message,
            },
            other => other,
        }
    }

    pub fn corrupt(component: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanBError::Corrupt {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Convert std::io::Error to PlanBError::Io
impl From<std::io::Error> for PlanBError {
    fn from(err: std::io::Error) -> Self {
        PlanBError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// heed errors are not `Clone`, so they are rendered on conversion.
impl From<heed::Error> for PlanBError {
    fn from(err: heed::Error) -> Self {
        match err {
            heed::Error::Io(io) => io.into(),
            other => PlanBError::Lmdb {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for PlanBError {
    fn from(err: serde_json::Error) -> Self {
        PlanBError::corrupt("schema descriptor", err.to_string())
    }
}

/// Result type alias for PlanB operations
pub type PlanBResult<T> = Result<T, PlanBError>;

/// Lowercase hex rendering used in error messages.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlanBError::SizeExceeded {
            component: "key".into(),
            size: 512,
            max: 511,
        };

        let display = format!("{}", err);
        assert!(display.contains("key too large"));
        assert!(display.contains("512"));
        assert!(display.contains("511"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PlanBError = io_err.into();

        match err.clone().with_path("/tmp/shard") {
            PlanBError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert_eq!(path, Some(PathBuf::from("/tmp/shard")));
            }
            _ => panic!("Expected Io error"),
        }
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_categories() {
        let missing = PlanBError::MissingLookup { table: "uid".into(), id: hex(&[0, 1]) };
        assert_eq!(missing.category(), ErrorCategory::Corruption);
        assert!(missing.to_string().contains("0001"));

        let closed = PlanBError::ShuttingDown { store: "metrics".into() };
        assert_eq!(closed.category(), ErrorCategory::Lifecycle);

        let schema = PlanBError::SchemaMismatch {
            store: "metrics".into(),
            expected: "a".into(),
            found: "b".into(),
        };
        assert_eq!(schema.category(), ErrorCategory::Configuration);
    }
}
