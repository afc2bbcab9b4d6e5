//! # Strata
//!
//! Versioned, checksummed schema migrations for Rust.
//!
//! Strata provides:
//! - Timestamp-versioned migrations stored as `up.sql` / `down.sql` pairs
//! - A history table with SHA-256 checksums that refuses to run edited migrations
//! - Transactional apply and rollback with per-migration or batch semantics
//! - Model-driven diffing that emits dependency-ordered SQL for PostgreSQL, MySQL and SQLite
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MigrationError> {
//!     let adapter = SqliteAdapter::connect("sqlite://app.db").await?;
//!     let config = MigratorConfig::new().migrations_dir("./migrations");
//!     let manager = MigrationManager::from_config(Arc::new(adapter), config);
//!
//!     let report = manager.migrate(None).await?.into_result()?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Migration engine: history, execution, diffing and SQL generation.
pub mod migrate {
    pub use strata_migrate::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        DatabaseAdapter, Dialect, MigrateResult, Migration, MigrationError, MigrationManager,
        MigratorConfig, ModelDefinition, ModelSet, RunReport, SchemaSnapshot, SqliteAdapter,
        StatusReport, TransactionMode,
    };
}

// Re-export key types at the crate root
pub use migrate::{MigrateResult, MigrationError, MigrationManager};
