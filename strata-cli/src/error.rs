//! CLI error types and result alias.

use miette::Diagnostic;
use strata_migrate::MigrationError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(code(strata::config))]
    Config(String),

    /// Migration engine error
    #[error("Migration error: {0}")]
    #[diagnostic(code(strata::migration))]
    Migration(MigrationError),

    /// Integrity failure: an applied migration was edited
    #[error("{0}")]
    #[diagnostic(
        code(strata::integrity),
        help("restore the original migration files, or create a new migration for the change")
    )]
    Integrity(MigrationError),

    /// Database error
    #[error("Database error: {0}")]
    #[diagnostic(code(strata::database))]
    Database(String),

    /// Command error
    #[error("Command error: {0}")]
    #[diagnostic(code(strata::command))]
    Command(String),
}

impl CliError {
    /// Wrap an engine error, singling out checksum drift.
    pub fn from_migration(err: MigrationError) -> Self {
        match err {
            MigrationError::ChecksumMismatch { .. } => Self::Integrity(err),
            other => Self::Migration(other),
        }
    }
}

impl From<MigrationError> for CliError {
    fn from(err: MigrationError) -> Self {
        Self::from_migration(err)
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(format!("Failed to parse TOML: {}", err))
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(err: toml::ser::Error) -> Self {
        CliError::Config(format!("Failed to serialize TOML: {}", err))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Command(format!("Failed to render JSON: {}", err))
    }
}

impl From<strata_migrate::AdapterError> for CliError {
    fn from(err: strata_migrate::AdapterError) -> Self {
        CliError::Database(err.to_string())
    }
}
