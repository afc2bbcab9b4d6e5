//! # strata-migrate
//!
//! Versioned schema migrations for relational databases.
//!
//! This crate provides functionality for:
//! - Loading ordered, checksummed migrations from a directory (or memory)
//! - Tracking applied migrations in a ledger table inside the target database
//! - Applying and rolling back migrations one transaction at a time, or as a
//!   single batch on backends with transactional DDL
//! - Refusing to run when an applied migration has been edited afterwards
//! - Building schema snapshots from declarative models, diffing them, and
//!   rendering the diff as PostgreSQL, MySQL or SQLite DDL
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ Models       │────▶│ Snapshot/Diff  │────▶│ SQL Gen     │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!                                                    │
//!                                                    ▼
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ Repository   │────▶│ Manager        │◀───▶│ Record Store│
//! └──────────────┘     └────────────────┘     └─────────────┘
//!                              │
//!                              ▼
//!                      ┌────────────────┐
//!                      │ Adapter + Lock │
//!                      └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_migrate::{MigrationManager, MigratorConfig, SqliteAdapter};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = Arc::new(SqliteAdapter::connect("sqlite://./dev.db").await?);
//! let config = MigratorConfig::new().migrations_dir("./migrations");
//! let manager = MigrationManager::from_config(adapter, config);
//!
//! let report = manager.migrate(None).await?;
//! println!("{}", report.summary());
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod checksum;
pub mod dialect;
pub mod diff;
pub mod error;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod record;
pub mod repository;
pub mod schema;
pub mod sql;

// Re-exports
pub use adapter::{AdapterError, AdapterResult, DatabaseAdapter, Row, SqlValue, SqliteAdapter};
pub use dialect::Dialect;
pub use diff::{DiffOperation, DiffOptions, OperationKind, diff, diff_with};
pub use error::{BatchProgress, MigrateResult, MigrationError};
pub use lock::{CoordinationLock, InProcessLock, LockGuard, TableLock};
pub use manager::{
    Compensation, MigrationManager, MigrationOutcome, MigrationStatus, MigratorConfig, RunReport,
    SqlPreview, StatusReport, TransactionMode,
};
pub use migration::{Direction, Migration, MigrationState};
pub use record::{MigrationRecord, RecordStatus, RecordStore, SqlRecordStore};
pub use repository::{DirectorySource, MemorySource, MigrationRepository, MigrationSource};
pub use schema::{
    FieldDefinition, ModelDefinition, ModelSet, SchemaSnapshot, SemanticType, build_snapshot,
};
pub use sql::{MigrationSql, SqlGenerator, generate_sql};
