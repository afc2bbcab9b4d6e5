//! Database connections for CLI commands.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use strata_migrate::{
    AdapterError, AdapterResult, DatabaseAdapter, Dialect, Row, SqlValue, SqliteAdapter,
};

use crate::error::{CliError, CliResult};

/// Open the configured database.
///
/// Only SQLite is bundled with this binary. Relative SQLite paths are
/// resolved against `base`.
pub async fn open(dialect: Dialect, url: &str, base: &Path) -> CliResult<Arc<dyn DatabaseAdapter>> {
    match dialect {
        Dialect::Sqlite => {
            let adapter = match sqlite_path(url) {
                Some(path) if Path::new(path).is_relative() => {
                    SqliteAdapter::open(base.join(path)).await?
                }
                _ => SqliteAdapter::connect(url).await?,
            };
            Ok(Arc::new(adapter))
        }
        other => Err(CliError::Config(format!(
            "no {} driver is built into this binary; use a sqlite:// URL or embed strata-migrate with your own adapter",
            other
        ))),
    }
}

fn sqlite_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    match rest {
        "" | ":memory:" => None,
        path => Some(path),
    }
}

/// Adapter for commands that only need a dialect.
///
/// Creating migrations and rendering SQL never touch the database, so these
/// commands work without a connection for every dialect.
#[derive(Debug, Clone, Copy)]
pub struct OfflineAdapter {
    dialect: Dialect,
}

impl OfflineAdapter {
    /// Create an adapter for a dialect.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn refuse<T>(&self) -> AdapterResult<T> {
        Err(AdapterError::connection(format!(
            "command runs without a {} connection",
            self.dialect
        )))
    }
}

#[async_trait]
impl DatabaseAdapter for OfflineAdapter {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, _sql: &str, _params: &[SqlValue]) -> AdapterResult<u64> {
        self.refuse()
    }

    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> AdapterResult<Vec<Row>> {
        self.refuse()
    }

    async fn begin_transaction(&self) -> AdapterResult<()> {
        self.refuse()
    }

    async fn commit(&self) -> AdapterResult<()> {
        self.refuse()
    }

    async fn rollback(&self) -> AdapterResult<()> {
        self.refuse()
    }
}
