//! Error types for the migration engine.

use thiserror::Error;

use crate::migration::Direction;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// How far a batch got before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchProgress {
    /// Migrations that completed before the failure.
    pub succeeded: usize,
    /// Migrations that were never started.
    pub not_attempted: usize,
}

impl std::fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, 1 failed, {} not attempted",
            self.succeeded, self.not_attempted
        )
    }
}

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error outside of a migration body.
    #[error("Database error: {0}")]
    Database(String),

    /// A recorded checksum no longer matches the migration source.
    #[error("Checksum mismatch for migration '{version}': recorded {expected}, source has {actual}")]
    ChecksumMismatch {
        /// Migration version.
        version: String,
        /// Checksum stored in the ledger.
        expected: String,
        /// Checksum of the current definition.
        actual: String,
    },

    /// Two migration definitions share a version.
    #[error("Duplicate migration version '{0}'")]
    DuplicateVersion(String),

    /// A migration definition is missing required SQL.
    #[error("Malformed migration '{version}': {reason}")]
    MalformedMigration {
        /// Migration version.
        version: String,
        /// What is wrong with it.
        reason: String,
    },

    /// New tables reference each other in a cycle.
    #[error("Cyclic foreign key dependency between new tables: {cycle}")]
    CyclicDependency {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },

    /// The backend rejected a migration's SQL.
    #[error("Migration '{version}' failed during {phase}: {message} ({progress})")]
    Execution {
        /// Migration version.
        version: String,
        /// Which half of the migration was running.
        phase: Direction,
        /// Backend error message.
        message: String,
        /// Batch progress at the time of failure.
        progress: BatchProgress,
    },

    /// Another run holds the coordination lock.
    #[error("Failed to acquire migration lock: {0}")]
    LockAcquisition(String),

    /// Model metadata is invalid.
    #[error("Invalid model definition: {0}")]
    InvalidModel(String),

    /// The dialect cannot express an operation.
    #[error("{dialect} cannot perform '{operation}' in place")]
    UnsupportedOperation {
        /// Dialect name.
        dialect: String,
        /// Operation kind.
        operation: String,
    },

    /// Serialization of snapshots or model files failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Migration not found.
    #[error("Migration '{0}' not found")]
    NotFound(String),

    /// No changes to migrate.
    #[error("No schema changes detected")]
    NoChanges,
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a malformed migration error.
    pub fn malformed(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMigration {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Create a lock acquisition error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockAcquisition(msg.into())
    }

    /// Create an invalid model error.
    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this is a recoverable error.
    ///
    /// Only lock contention and "nothing to do" qualify; everything else
    /// needs an operator.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockAcquisition(_) | Self::NoChanges)
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MigrationError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(format!("Failed to parse TOML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::NotFound("20240101_120000".to_string());
        assert!(err.to_string().contains("20240101_120000"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = MigrationError::ChecksumMismatch {
            version: "20240101_120000".to_string(),
            expected: "abc".to_string(),
            actual: "xyz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("xyz"));
    }

    #[test]
    fn test_execution_error_reports_progress() {
        let err = MigrationError::Execution {
            version: "20240101_130000".to_string(),
            phase: Direction::Up,
            message: "syntax error".to_string(),
            progress: BatchProgress {
                succeeded: 1,
                not_attempted: 1,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("during up"));
        assert!(msg.contains("1 succeeded, 1 failed, 1 not attempted"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(MigrationError::NoChanges.is_recoverable());
        assert!(MigrationError::LockAcquisition("held".to_string()).is_recoverable());
        assert!(!MigrationError::DuplicateVersion("v1".to_string()).is_recoverable());
        assert!(
            !MigrationError::CyclicDependency {
                cycle: "a -> b -> a".to_string()
            }
            .is_recoverable()
        );
    }
}
