//! Migration history tracking.
//!
//! The ledger holds one row per migration version. Every write goes through
//! the adapter the caller passes in, so it joins whatever transaction the
//! caller has open; the store never begins or commits on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{DatabaseAdapter, Row, SqlValue};
use crate::dialect::Dialect;
use crate::error::{MigrateResult, MigrationError};
use crate::migration::{Direction, Migration};

/// Default name of the ledger table.
pub const DEFAULT_HISTORY_TABLE: &str = "_strata_migrations";

/// Persisted status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Known but not applied.
    Pending,
    /// Applied and committed.
    Applied,
    /// The up phase failed.
    Failed,
    /// Reverted by a rollback.
    RolledBack,
}

impl RecordStatus {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(MigrationError::database(format!(
                "unknown migration status '{}'",
                other
            ))),
        }
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration version.
    pub version: String,
    /// Migration name.
    pub name: String,
    /// Checksum of the migration content when it was recorded.
    pub checksum: String,
    /// Current status.
    pub status: RecordStatus,
    /// When the row was last written.
    pub applied_at: DateTime<Utc>,
    /// Duration of the last run in milliseconds.
    pub execution_time_ms: i64,
    /// Backend error from the last failed run.
    pub error_message: Option<String>,
}

impl MigrationRecord {
    /// A fresh `applied` record for a migration.
    pub fn applied(migration: &Migration, execution_time_ms: i64) -> Self {
        Self {
            version: migration.version().to_string(),
            name: migration.name().to_string(),
            checksum: migration.checksum().to_string(),
            status: RecordStatus::Applied,
            applied_at: Utc::now(),
            execution_time_ms,
            error_message: None,
        }
    }

    fn from_row(row: &Row) -> MigrateResult<Self> {
        let text = |column: &str| -> MigrateResult<String> {
            row.get(column)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    MigrationError::database(format!("ledger row is missing '{}'", column))
                })
        };

        let applied_at = DateTime::parse_from_rfc3339(&text("applied_at")?)
            .map_err(|e| MigrationError::database(format!("invalid applied_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            version: text("version")?,
            name: text("name")?,
            checksum: text("checksum")?,
            status: text("status")?.parse()?,
            applied_at,
            execution_time_ms: row
                .get("execution_time_ms")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
            error_message: row
                .get("error_message")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

/// Persisted ledger of migration history.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the ledger if it does not exist. Safe to call repeatedly.
    async fn ensure_initialized(&self, db: &dyn DatabaseAdapter) -> MigrateResult<()>;

    /// Applied migrations, ascending by version.
    async fn list_applied(&self, db: &dyn DatabaseAdapter) -> MigrateResult<Vec<MigrationRecord>>;

    /// Every ledger row, ascending by version.
    async fn list_all(&self, db: &dyn DatabaseAdapter) -> MigrateResult<Vec<MigrationRecord>>;

    /// The row for one version.
    async fn get(
        &self,
        db: &dyn DatabaseAdapter,
        version: &str,
    ) -> MigrateResult<Option<MigrationRecord>>;

    /// Record a migration as applied.
    async fn mark_applied(
        &self,
        db: &dyn DatabaseAdapter,
        record: &MigrationRecord,
    ) -> MigrateResult<()>;

    /// Mark an applied migration as rolled back.
    async fn mark_rolled_back(&self, db: &dyn DatabaseAdapter, version: &str) -> MigrateResult<()>;

    /// Record a failed run.
    ///
    /// An `up` failure stores the row as `failed`. A `down` failure leaves the
    /// row `applied` (the schema change is still in place) and keeps the error.
    async fn record_failure(
        &self,
        db: &dyn DatabaseAdapter,
        migration: &Migration,
        phase: Direction,
        message: &str,
    ) -> MigrateResult<()>;
}

/// [`RecordStore`] backed by a table in the target database.
#[derive(Debug, Clone)]
pub struct SqlRecordStore {
    table: String,
}

impl SqlRecordStore {
    /// Use the given ledger table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Ledger table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_sql(&self, dialect: Dialect) -> String {
        let big_int = match dialect {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres | Dialect::MySql => "BIGINT",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             version VARCHAR(255) PRIMARY KEY,\n    \
             name VARCHAR(255) NOT NULL,\n    \
             checksum VARCHAR(64) NOT NULL,\n    \
             status VARCHAR(20) NOT NULL,\n    \
             applied_at VARCHAR(64) NOT NULL,\n    \
             execution_time_ms {} NOT NULL DEFAULT 0,\n    \
             error_message TEXT\n)",
            dialect.quote_ident(&self.table),
            big_int
        )
    }

    fn select_sql(&self, dialect: Dialect, filter: &str) -> String {
        format!(
            "SELECT version, name, checksum, status, applied_at, execution_time_ms, error_message \
             FROM {}{} ORDER BY version ASC",
            dialect.quote_ident(&self.table),
            filter
        )
    }

    fn upsert_sql(&self, dialect: Dialect) -> String {
        let placeholders: Vec<String> = (1..=7).map(|n| dialect.placeholder(n)).collect();
        let insert = format!(
            "INSERT INTO {} (version, name, checksum, status, applied_at, execution_time_ms, error_message) \
             VALUES ({})",
            dialect.quote_ident(&self.table),
            placeholders.join(", ")
        );
        let columns = [
            "name",
            "checksum",
            "status",
            "applied_at",
            "execution_time_ms",
            "error_message",
        ];

        match dialect {
            Dialect::MySql => {
                let sets: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{c} = VALUES({c})"))
                    .collect();
                format!("{} ON DUPLICATE KEY UPDATE {}", insert, sets.join(", "))
            }
            Dialect::Postgres | Dialect::Sqlite => {
                let sets: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect();
                format!("{} ON CONFLICT (version) DO UPDATE SET {}", insert, sets.join(", "))
            }
        }
    }

    async fn upsert(&self, db: &dyn DatabaseAdapter, record: &MigrationRecord) -> MigrateResult<()> {
        let sql = self.upsert_sql(db.dialect());
        let params = [
            SqlValue::from(record.version.as_str()),
            SqlValue::from(record.name.as_str()),
            SqlValue::from(record.checksum.as_str()),
            SqlValue::from(record.status.as_str()),
            SqlValue::from(record.applied_at.to_rfc3339()),
            SqlValue::Integer(record.execution_time_ms),
            SqlValue::from(record.error_message.clone()),
        ];
        db.execute(&sql, &params).await?;
        Ok(())
    }

    async fn select(
        &self,
        db: &dyn DatabaseAdapter,
        filter: &str,
        params: &[SqlValue],
    ) -> MigrateResult<Vec<MigrationRecord>> {
        let sql = self.select_sql(db.dialect(), filter);
        db.query(&sql, params)
            .await?
            .iter()
            .map(MigrationRecord::from_row)
            .collect()
    }
}

impl Default for SqlRecordStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TABLE)
    }
}

#[async_trait::async_trait]
impl RecordStore for SqlRecordStore {
    async fn ensure_initialized(&self, db: &dyn DatabaseAdapter) -> MigrateResult<()> {
        let dialect = db.dialect();
        if let Err(err) = db.execute(&self.create_sql(dialect), &[]).await {
            // A concurrent initializer may have won the race on catalogs
            // that reject duplicate CREATE ... IF NOT EXISTS.
            let probe = format!("SELECT COUNT(*) AS n FROM {}", dialect.quote_ident(&self.table));
            db.query(&probe, &[]).await.map_err(|_| err)?;
        }
        debug!(table = %self.table, "Migration ledger ready");
        Ok(())
    }

    async fn list_applied(&self, db: &dyn DatabaseAdapter) -> MigrateResult<Vec<MigrationRecord>> {
        let filter = format!(" WHERE status = {}", db.dialect().placeholder(1));
        self.select(db, &filter, &[SqlValue::from(RecordStatus::Applied.as_str())])
            .await
    }

    async fn list_all(&self, db: &dyn DatabaseAdapter) -> MigrateResult<Vec<MigrationRecord>> {
        self.select(db, "", &[]).await
    }

    async fn get(
        &self,
        db: &dyn DatabaseAdapter,
        version: &str,
    ) -> MigrateResult<Option<MigrationRecord>> {
        let filter = format!(" WHERE version = {}", db.dialect().placeholder(1));
        Ok(self
            .select(db, &filter, &[SqlValue::from(version)])
            .await?
            .into_iter()
            .next())
    }

    async fn mark_applied(
        &self,
        db: &dyn DatabaseAdapter,
        record: &MigrationRecord,
    ) -> MigrateResult<()> {
        let mut record = record.clone();
        record.status = RecordStatus::Applied;
        record.error_message = None;
        debug!(version = %record.version, "Recording migration as applied");
        self.upsert(db, &record).await
    }

    async fn mark_rolled_back(&self, db: &dyn DatabaseAdapter, version: &str) -> MigrateResult<()> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET status = {}, applied_at = {}, error_message = NULL WHERE version = {}",
            dialect.quote_ident(&self.table),
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3)
        );
        debug!(version = %version, "Recording migration as rolled back");
        let updated = db
            .execute(
                &sql,
                &[
                    SqlValue::from(RecordStatus::RolledBack.as_str()),
                    SqlValue::from(Utc::now().to_rfc3339()),
                    SqlValue::from(version),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(MigrationError::NotFound(version.to_string()));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        db: &dyn DatabaseAdapter,
        migration: &Migration,
        phase: Direction,
        message: &str,
    ) -> MigrateResult<()> {
        debug!(version = %migration.version(), phase = %phase, "Recording migration failure");
        match phase {
            Direction::Up => {
                let record = MigrationRecord {
                    version: migration.version().to_string(),
                    name: migration.name().to_string(),
                    checksum: migration.checksum().to_string(),
                    status: RecordStatus::Failed,
                    applied_at: Utc::now(),
                    execution_time_ms: 0,
                    error_message: Some(message.to_string()),
                };
                self.upsert(db, &record).await
            }
            Direction::Down => {
                let dialect = db.dialect();
                let sql = format!(
                    "UPDATE {} SET error_message = {} WHERE version = {}",
                    dialect.quote_ident(&self.table),
                    dialect.placeholder(1),
                    dialect.placeholder(2)
                );
                db.execute(&sql, &[SqlValue::from(message), SqlValue::from(migration.version())])
                    .await?;
                Ok(())
            }
        }
    }
}
