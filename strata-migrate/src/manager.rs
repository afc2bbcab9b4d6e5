//! Migration orchestration.
//!
//! [`MigrationManager`] composes a [`MigrationRepository`], a [`RecordStore`],
//! a [`CoordinationLock`] and a [`DatabaseAdapter`]. Every run holds the lock
//! for its whole duration and verifies recorded checksums before any new SQL
//! is executed.
//!
//! Runs are fail-fast: the first failing migration stops the run, and the
//! returned [`RunReport`] says how many migrations completed, which one failed
//! and how many were never attempted.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::DatabaseAdapter;
use crate::checksum;
use crate::diff::{self, DiffOperation, DiffOptions};
use crate::error::{BatchProgress, MigrateResult, MigrationError};
use crate::lock::{CoordinationLock, DEFAULT_LOCK_TABLE, LockGuard, TableLock};
use crate::migration::{Direction, Migration, MigrationState, next_version_after};
use crate::record::{
    DEFAULT_HISTORY_TABLE, MigrationRecord, RecordStatus, RecordStore, SqlRecordStore,
};
use crate::repository::{DirectorySource, MigrationRepository};
use crate::schema::{ModelDefinition, SchemaSnapshot, build_snapshot};
use crate::sql::{MigrationSql, SqlGenerator, split_statements};

/// How migrations in one run are grouped into transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// One transaction per migration. Earlier migrations stay applied when a
    /// later one fails.
    #[default]
    PerMigration,
    /// One transaction around the whole run. Only honored when the backend
    /// can roll back DDL.
    Batch,
}

/// Configuration for the migration manager.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Path to the migrations directory.
    pub migrations_dir: PathBuf,
    /// Ledger table name.
    pub history_table: String,
    /// Lock table name.
    pub lock_table: String,
    /// Transaction grouping.
    pub transaction_mode: TransactionMode,
    /// How long to wait for the lock; `None` fails immediately.
    pub lock_timeout: Option<Duration>,
    /// Pause between lock attempts while waiting.
    pub lock_retry_interval: Duration,
    /// Whether generated migrations may drop tables and columns.
    pub allow_destructive: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            transaction_mode: TransactionMode::PerMigration,
            lock_timeout: None,
            lock_retry_interval: Duration::from_millis(250),
            allow_destructive: false,
        }
    }
}

impl MigratorConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the migrations directory.
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the ledger table name.
    pub fn history_table(mut self, table: impl Into<String>) -> Self {
        self.history_table = table.into();
        self
    }

    /// Set the lock table name.
    pub fn lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    /// Set the transaction mode.
    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Wait up to `timeout` for the lock instead of failing at once.
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the pause between lock attempts.
    pub fn lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Allow generated migrations to drop tables and columns.
    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }
}

/// What happened to the partial effects of a failed migration on a backend
/// without transactional DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum Compensation {
    /// The down SQL ran and undid the partial changes.
    Applied,
    /// The down SQL failed; manual cleanup is required.
    Failed(String),
    /// The migration has no down SQL.
    Unavailable,
}

/// Result for one migration in a run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    /// Migration version.
    pub version: String,
    /// Migration name.
    pub name: String,
    /// Final state.
    pub state: MigrationState,
    /// Whether the migration's SQL was started.
    pub attempted: bool,
    /// Whether a successful step was undone by a batch rollback.
    pub reverted: bool,
    /// Execution time in milliseconds.
    pub duration_ms: i64,
    /// Backend error, if the migration failed.
    pub error: Option<String>,
    /// Cleanup after a failure without transactional DDL.
    pub compensation: Option<Compensation>,
}

impl MigrationOutcome {
    fn new(migration: &Migration, state: MigrationState, attempted: bool) -> Self {
        Self {
            version: migration.version().to_string(),
            name: migration.name().to_string(),
            state,
            attempted,
            reverted: false,
            duration_ms: 0,
            error: None,
            compensation: None,
        }
    }

    fn not_attempted(migration: &Migration, direction: Direction) -> Self {
        let state = match direction {
            Direction::Up => MigrationState::Pending,
            Direction::Down => MigrationState::Applied,
        };
        Self::new(migration, state, false)
    }

    fn started(migration: &Migration, direction: Direction) -> Self {
        let state = match direction {
            Direction::Up => MigrationState::Applying,
            Direction::Down => MigrationState::RollingBack,
        };
        Self::new(migration, state, true)
    }

    fn finish(&mut self, result: Result<(), String>, started: Instant) {
        let next = match (self.state, result.is_ok()) {
            (MigrationState::Applying, true) => MigrationState::Applied,
            (MigrationState::Applying, false) => MigrationState::Failed,
            (_, true) => MigrationState::RolledBack,
            (_, false) => MigrationState::RollbackFailed,
        };
        debug_assert!(self.state.can_transition_to(next));
        self.state = next;
        self.duration_ms = elapsed_ms(started);
        self.error = result.err();
    }

    /// Whether the migration completed and its effects persist.
    pub fn succeeded(&self) -> bool {
        self.attempted && self.error.is_none() && !self.reverted
    }
}

/// Result of a migrate or rollback run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Direction of the run.
    pub direction: Direction,
    /// One entry per planned migration, in execution order.
    pub outcomes: Vec<MigrationOutcome>,
    /// Whether the run stopped early because it was cancelled.
    pub cancelled: bool,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl RunReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            outcomes: Vec::new(),
            cancelled: false,
            duration_ms: 0,
        }
    }

    fn skip(&mut self, direction: Direction, migrations: &[Migration]) {
        self.outcomes.extend(
            migrations
                .iter()
                .map(|m| MigrationOutcome::not_attempted(m, direction)),
        );
    }

    /// Migrations that completed and persist.
    pub fn applied_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// The failed migration, if any.
    pub fn failed(&self) -> Option<&MigrationOutcome> {
        self.outcomes.iter().find(|o| o.error.is_some())
    }

    /// Migrations that were never started.
    pub fn not_attempted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.attempted).count()
    }

    /// Completed migrations undone by a batch rollback.
    pub fn reverted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.reverted).count()
    }

    /// Check if every planned migration completed.
    pub fn is_success(&self) -> bool {
        self.failed().is_none() && !self.cancelled
    }

    /// Get a summary of the run, e.g. `2 applied, 1 failed, 1 not attempted`.
    pub fn summary(&self) -> String {
        if self.outcomes.is_empty() {
            return match self.direction {
                Direction::Up => "No pending migrations".to_string(),
                Direction::Down => "No migrations to roll back".to_string(),
            };
        }

        let verb = match self.direction {
            Direction::Up => "applied",
            Direction::Down => "rolled back",
        };
        let failed = self.outcomes.iter().filter(|o| o.error.is_some()).count();
        let mut summary = format!(
            "{} {}, {} failed, {} not attempted",
            self.applied_count(),
            verb,
            failed,
            self.not_attempted_count()
        );
        if self.reverted_count() > 0 {
            summary.push_str(&format!(", {} reverted", self.reverted_count()));
        }
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }

    /// Turn a failed run into [`MigrationError::Execution`].
    pub fn into_result(self) -> MigrateResult<Self> {
        let Some(failed) = self.failed() else {
            return Ok(self);
        };
        Err(MigrationError::Execution {
            version: failed.version.clone(),
            phase: self.direction,
            message: failed.error.clone().unwrap_or_default(),
            progress: BatchProgress {
                succeeded: self.applied_count(),
                not_attempted: self.not_attempted_count(),
            },
        })
    }
}

/// Status of one migration, merged from the repository and the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Migration version.
    pub version: String,
    /// Migration name.
    pub name: String,
    /// Ledger status; `pending` when there is no ledger row.
    pub status: RecordStatus,
    /// When the ledger row was last written.
    pub applied_at: Option<DateTime<Utc>>,
    /// Duration of the last run.
    pub execution_time_ms: Option<i64>,
    /// Whether the recorded checksum matches the definition.
    pub checksum_matches: Option<bool>,
    /// Whether a definition exists in the repository.
    pub has_source: bool,
    /// Error from the last failed run.
    pub error_message: Option<String>,
}

/// Status of every known migration, ascending by version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    /// Per-migration entries.
    pub migrations: Vec<MigrationStatus>,
}

impl StatusReport {
    /// Number of applied migrations.
    pub fn applied_count(&self) -> usize {
        self.count(RecordStatus::Applied)
    }

    /// Number of migrations not yet applied.
    pub fn pending_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|m| m.has_source && m.status != RecordStatus::Applied)
            .count()
    }

    /// Applied migrations whose definition changed after they ran.
    pub fn drifted(&self) -> Vec<&MigrationStatus> {
        self.migrations
            .iter()
            .filter(|m| m.status == RecordStatus::Applied && m.checksum_matches == Some(false))
            .collect()
    }

    fn count(&self, status: RecordStatus) -> usize {
        self.migrations.iter().filter(|m| m.status == status).count()
    }
}

/// Operations and SQL a diff-generated migration would contain.
#[derive(Debug, Clone, Serialize)]
pub struct SqlPreview {
    /// Ordered diff operations.
    pub operations: Vec<DiffOperation>,
    /// Rendered up and down SQL.
    pub sql: MigrationSql,
}

impl SqlPreview {
    /// Check if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operation counts by kind.
    pub fn summary(&self) -> String {
        diff::summary(&self.operations)
    }
}

enum RollbackTarget {
    Version(String),
    Steps(usize),
}

/// Applies, reverts and reports migrations against one database.
pub struct MigrationManager {
    adapter: Arc<dyn DatabaseAdapter>,
    repository: MigrationRepository,
    store: Arc<dyn RecordStore>,
    lock: Arc<dyn CoordinationLock>,
    config: MigratorConfig,
    cancel: CancellationToken,
}

impl MigrationManager {
    /// Create a manager from explicit collaborators.
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        repository: MigrationRepository,
        store: Arc<dyn RecordStore>,
        lock: Arc<dyn CoordinationLock>,
        config: MigratorConfig,
    ) -> Self {
        Self {
            adapter,
            repository,
            store,
            lock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a manager that reads migrations from `config.migrations_dir`
    /// and keeps its ledger and lock in the target database.
    pub fn from_config(adapter: Arc<dyn DatabaseAdapter>, config: MigratorConfig) -> Self {
        let repository =
            MigrationRepository::new(DirectorySource::new(config.migrations_dir.clone()));
        let store = Arc::new(SqlRecordStore::new(config.history_table.clone()));
        let lock = Arc::new(
            TableLock::new(config.lock_table.clone()).retry_interval(config.lock_retry_interval),
        );
        Self::new(adapter, repository, store, lock, config)
    }

    /// Get the configuration.
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Get the repository.
    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    /// Token that stops runs at the next migration boundary once cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn db(&self) -> &dyn DatabaseAdapter {
        self.adapter.as_ref()
    }

    /// Create the ledger if needed.
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.store.ensure_initialized(self.db()).await
    }

    /// Apply pending migrations up to and including `target`, or all of them.
    ///
    /// Fails before executing anything if the lock is held, if an applied
    /// migration's checksum no longer matches its definition, or if `target`
    /// is unknown. A failing migration does not produce an `Err`; it is
    /// reported in the returned [`RunReport`] (see [`RunReport::into_result`]).
    pub async fn migrate(&self, target: Option<&str>) -> MigrateResult<RunReport> {
        let started = Instant::now();
        self.initialize().await?;

        let guard = self.lock.acquire(&self.adapter, self.config.lock_timeout).await?;
        let result = self.migrate_locked(target, started).await;
        self.release(guard).await;
        result
    }

    async fn migrate_locked(
        &self,
        target: Option<&str>,
        started: Instant,
    ) -> MigrateResult<RunReport> {
        let pending = self.pending(target).await?;
        if pending.is_empty() {
            info!("Database is up to date");
        } else {
            info!(count = pending.len(), "Applying migrations");
        }
        self.run(Direction::Up, pending, started).await
    }

    /// Roll back every applied migration newer than `target`, newest first.
    pub async fn rollback(&self, target: &str) -> MigrateResult<RunReport> {
        self.rollback_to(RollbackTarget::Version(target.to_string()))
            .await
    }

    /// Roll back the `steps` most recently applied migrations.
    pub async fn rollback_steps(&self, steps: usize) -> MigrateResult<RunReport> {
        self.rollback_to(RollbackTarget::Steps(steps)).await
    }

    async fn rollback_to(&self, target: RollbackTarget) -> MigrateResult<RunReport> {
        let started = Instant::now();
        self.initialize().await?;

        let guard = self.lock.acquire(&self.adapter, self.config.lock_timeout).await?;
        let result = self.rollback_locked(&target, started).await;
        self.release(guard).await;
        result
    }

    async fn rollback_locked(
        &self,
        target: &RollbackTarget,
        started: Instant,
    ) -> MigrateResult<RunReport> {
        let migrations = self.repository.load().await?;
        let applied = self.store.list_applied(self.db()).await?;
        verify_integrity(&migrations, &applied)?;

        let mut selected: Vec<&MigrationRecord> = applied.iter().rev().collect();
        match target {
            RollbackTarget::Version(version) => {
                selected.retain(|r| r.version.as_str() > version.as_str())
            }
            RollbackTarget::Steps(steps) => selected.truncate(*steps),
        }

        let by_version: HashMap<&str, &Migration> =
            migrations.iter().map(|m| (m.version(), m)).collect();
        let mut plan = Vec::with_capacity(selected.len());
        for record in selected {
            let migration = by_version
                .get(record.version.as_str())
                .ok_or_else(|| MigrationError::NotFound(record.version.clone()))?;
            MigrationRepository::ensure_reversible(migration)?;
            plan.push((*migration).clone());
        }

        if plan.is_empty() {
            info!("Nothing to roll back");
        } else {
            info!(count = plan.len(), "Rolling back migrations");
        }
        self.run(Direction::Down, plan, started).await
    }

    /// Status of every migration known to the repository or the ledger.
    pub async fn status(&self) -> MigrateResult<StatusReport> {
        self.initialize().await?;
        let migrations = self.repository.load().await?;
        let mut records: HashMap<String, MigrationRecord> = self
            .store
            .list_all(self.db())
            .await?
            .into_iter()
            .map(|r| (r.version.clone(), r))
            .collect();

        let mut entries = Vec::with_capacity(migrations.len());
        for migration in &migrations {
            let record = records.remove(migration.version());
            entries.push(MigrationStatus {
                version: migration.version().to_string(),
                name: migration.name().to_string(),
                status: record
                    .as_ref()
                    .map_or(RecordStatus::Pending, |r| r.status),
                applied_at: record.as_ref().map(|r| r.applied_at),
                execution_time_ms: record.as_ref().map(|r| r.execution_time_ms),
                checksum_matches: record
                    .as_ref()
                    .map(|r| checksum::verify(&r.checksum, migration)),
                has_source: true,
                error_message: record.and_then(|r| r.error_message),
            });
        }

        // Ledger rows whose definition has disappeared.
        for record in records.into_values() {
            entries.push(MigrationStatus {
                version: record.version,
                name: record.name,
                status: record.status,
                applied_at: Some(record.applied_at),
                execution_time_ms: Some(record.execution_time_ms),
                checksum_matches: None,
                has_source: false,
                error_message: record.error_message,
            });
        }

        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(StatusReport {
            migrations: entries,
        })
    }

    /// Migrations [`MigrationManager::migrate`] would apply, without
    /// applying them.
    pub async fn plan(&self, target: Option<&str>) -> MigrateResult<Vec<Migration>> {
        self.initialize().await?;
        self.pending(target).await
    }

    async fn pending(&self, target: Option<&str>) -> MigrateResult<Vec<Migration>> {
        let migrations = self.repository.load().await?;
        let applied = self.store.list_applied(self.db()).await?;
        verify_integrity(&migrations, &applied)?;

        if let Some(target) = target {
            if !migrations.iter().any(|m| m.version() == target) {
                return Err(MigrationError::NotFound(target.to_string()));
            }
        }

        let applied_versions: HashSet<&str> = applied.iter().map(|r| r.version.as_str()).collect();
        Ok(migrations
            .into_iter()
            .filter(|m| !applied_versions.contains(m.version()))
            .filter(|m| target.is_none_or(|t| m.version() <= t))
            .collect())
    }

    /// Write a new migration with a version after every existing one.
    pub async fn create_migration(
        &self,
        name: &str,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> MigrateResult<Migration> {
        let latest = self.repository.latest_version().await?;
        let version = next_version_after(latest.as_deref());

        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(MigrationError::malformed(version, "migration name is empty"));
        }
        let up_sql = up_sql.into();
        if up_sql.trim().is_empty() {
            return Err(MigrationError::malformed(version, "up SQL is missing"));
        }

        let migration = Migration::new(version, name, up_sql, down_sql);
        self.repository.save(&migration).await?;
        info!(
            version = %migration.version(),
            name = %migration.name(),
            "Created migration"
        );
        Ok(migration)
    }

    /// Diff two snapshots and write the result as a new migration.
    ///
    /// Fails with [`MigrationError::NoChanges`] when the snapshots are
    /// equivalent.
    pub async fn create_migration_from_snapshots(
        &self,
        name: &str,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
    ) -> MigrateResult<Migration> {
        let preview = self.preview_sql(old, new)?;
        if preview.is_empty() {
            return Err(MigrationError::NoChanges);
        }
        debug!(operations = %preview.summary(), "Generated migration from snapshots");
        self.create_migration(name, preview.sql.up, Some(preview.sql.down))
            .await
    }

    /// Build a snapshot from models, diff it against `old` and write the
    /// result as a new migration. Returns the migration and the new snapshot.
    pub async fn create_migration_from_models(
        &self,
        name: &str,
        old: &SchemaSnapshot,
        models: &[ModelDefinition],
    ) -> MigrateResult<(Migration, SchemaSnapshot)> {
        let new = build_snapshot(models)?;
        let migration = self.create_migration_from_snapshots(name, old, &new).await?;
        Ok((migration, new))
    }

    /// Check that models form a valid, creatable schema.
    pub fn validate_models(&self, models: &[ModelDefinition]) -> MigrateResult<SchemaSnapshot> {
        let snapshot = build_snapshot(models)?;
        // Creating every table from scratch surfaces foreign key cycles.
        diff::diff(&SchemaSnapshot::new(), &snapshot)?;
        Ok(snapshot)
    }

    /// Operations and SQL that turn `old` into `new`, rendered for the
    /// adapter's dialect.
    pub fn preview_sql(
        &self,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
    ) -> MigrateResult<SqlPreview> {
        let options = DiffOptions {
            include_destructive: self.config.allow_destructive,
        };
        let operations = diff::diff_with(old, new, options)?;

        if !self.config.allow_destructive {
            let skipped = diff::diff(old, new)?
                .iter()
                .filter(|op| op.is_destructive())
                .count();
            if skipped > 0 {
                warn!(
                    skipped,
                    "Destructive operations left out; enable allow_destructive to include them"
                );
            }
        }

        let sql = SqlGenerator::new(self.adapter.dialect()).generate(&operations)?;
        Ok(SqlPreview { operations, sql })
    }

    async fn release(&self, guard: LockGuard) {
        let holder = guard.holder().to_string();
        if let Err(err) = self.lock.release(&self.adapter, guard).await {
            warn!(holder = %holder, error = %err, "Failed to release migration lock");
        }
    }

    async fn run(
        &self,
        direction: Direction,
        migrations: Vec<Migration>,
        started: Instant,
    ) -> MigrateResult<RunReport> {
        let mut report = RunReport::new(direction);

        if !migrations.is_empty() {
            let batch = self.config.transaction_mode == TransactionMode::Batch;
            if batch && self.adapter.supports_transactional_ddl() {
                self.run_batch(direction, &migrations, &mut report).await?;
            } else {
                if batch {
                    warn!(
                        dialect = %self.adapter.dialect(),
                        "Backend cannot roll back DDL; running the batch one migration at a time"
                    );
                }
                self.run_each(direction, &migrations, &mut report).await;
            }
        }

        report.duration_ms = elapsed_ms(started);
        info!(direction = %direction, summary = %report.summary(), "Run finished");
        Ok(report)
    }

    async fn run_each(&self, direction: Direction, migrations: &[Migration], report: &mut RunReport) {
        for (i, migration) in migrations.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = migrations.len() - i, "Run cancelled");
                report.cancelled = true;
                report.skip(direction, &migrations[i..]);
                return;
            }

            let outcome = self.execute(direction, migration).await;
            let failed = outcome.error.is_some();
            report.outcomes.push(outcome);
            if failed {
                report.skip(direction, &migrations[i + 1..]);
                return;
            }
        }
    }

    async fn run_batch(
        &self,
        direction: Direction,
        migrations: &[Migration],
        report: &mut RunReport,
    ) -> MigrateResult<()> {
        let db = self.db();
        db.begin_transaction().await?;
        debug!(count = migrations.len(), "Opened batch transaction");

        let mut failed_at = None;
        for (i, migration) in migrations.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = migrations.len() - i, "Run cancelled");
                report.cancelled = true;
                report.skip(direction, &migrations[i..]);
                break;
            }

            let started = Instant::now();
            let mut outcome = MigrationOutcome::started(migration, direction);
            info!(
                version = %migration.version(),
                name = %migration.name(),
                direction = %direction,
                "Running migration"
            );
            let result = self.apply(direction, migration, started).await;
            let failed = result.is_err();
            outcome.finish(result, started);
            report.outcomes.push(outcome);

            if failed {
                failed_at = Some(i);
                report.skip(direction, &migrations[i + 1..]);
                break;
            }
        }

        let Some(index) = failed_at else {
            if let Err(err) = db.commit().await {
                if let Err(rollback_err) = db.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back batch after commit error");
                }
                return Err(MigrationError::database(format!(
                    "failed to commit migration batch: {}",
                    err
                )));
            }
            return Ok(());
        };

        if let Err(err) = db.rollback().await {
            warn!(error = %err, "Failed to roll back batch transaction");
        }
        for outcome in &mut report.outcomes[..index] {
            outcome.reverted = true;
        }

        let migration = &migrations[index];
        let message = report.outcomes[index].error.clone().unwrap_or_default();
        warn!(
            version = %migration.version(),
            reverted = index,
            error = %message,
            "Migration failed; batch rolled back"
        );
        self.record_failure(migration, direction, &message).await;
        Ok(())
    }

    async fn execute(&self, direction: Direction, migration: &Migration) -> MigrationOutcome {
        let started = Instant::now();
        let mut outcome = MigrationOutcome::started(migration, direction);
        info!(
            version = %migration.version(),
            name = %migration.name(),
            direction = %direction,
            "Running migration"
        );

        let result = if self.adapter.supports_transactional_ddl() {
            self.execute_in_transaction(direction, migration, started)
                .await
        } else {
            self.execute_direct(direction, migration, started, &mut outcome)
                .await
        };

        if let Err(message) = &result {
            warn!(
                version = %migration.version(),
                direction = %direction,
                error = %message,
                "Migration failed"
            );
            self.record_failure(migration, direction, message).await;
        }

        outcome.finish(result, started);
        outcome
    }

    async fn execute_in_transaction(
        &self,
        direction: Direction,
        migration: &Migration,
        started: Instant,
    ) -> Result<(), String> {
        let db = self.db();
        db.begin_transaction().await.map_err(|e| e.to_string())?;

        let result = match self.apply(direction, migration, started).await {
            Ok(()) => db.commit().await.map_err(|e| e.to_string()),
            Err(message) => Err(message),
        };

        if result.is_err() {
            if let Err(err) = db.rollback().await {
                warn!(
                    version = %migration.version(),
                    error = %err,
                    "Failed to roll back migration transaction"
                );
            }
        }
        result
    }

    /// Statement-by-statement execution for backends that cannot roll back
    /// DDL. A failed up migration is compensated with its down SQL.
    async fn execute_direct(
        &self,
        direction: Direction,
        migration: &Migration,
        started: Instant,
        outcome: &mut MigrationOutcome,
    ) -> Result<(), String> {
        let mut executed = 0;
        let mut failure = None;
        for statement in split_statements(sql_for(migration, direction)) {
            match self.db().execute(&statement, &[]).await {
                Ok(_) => executed += 1,
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                }
            }
        }

        let message = match failure {
            Some(message) => message,
            None => match self.record_success(direction, migration, started).await {
                Ok(()) => return Ok(()),
                Err(err) => err.to_string(),
            },
        };

        if direction == Direction::Up && executed > 0 {
            outcome.compensation = Some(self.compensate(migration).await);
        }
        Err(message)
    }

    async fn compensate(&self, migration: &Migration) -> Compensation {
        let Some(down_sql) = migration.down_sql() else {
            warn!(
                version = %migration.version(),
                "No down SQL to undo a partially applied migration"
            );
            return Compensation::Unavailable;
        };

        for statement in split_statements(down_sql) {
            if let Err(err) = self.db().execute(&statement, &[]).await {
                warn!(
                    version = %migration.version(),
                    error = %err,
                    "Compensating down SQL failed; manual cleanup required"
                );
                return Compensation::Failed(err.to_string());
            }
        }

        info!(version = %migration.version(), "Reverted partially applied migration");
        Compensation::Applied
    }

    async fn apply(
        &self,
        direction: Direction,
        migration: &Migration,
        started: Instant,
    ) -> Result<(), String> {
        for statement in split_statements(sql_for(migration, direction)) {
            self.db()
                .execute(&statement, &[])
                .await
                .map_err(|e| e.to_string())?;
        }
        self.record_success(direction, migration, started)
            .await
            .map_err(|e| e.to_string())
    }

    async fn record_success(
        &self,
        direction: Direction,
        migration: &Migration,
        started: Instant,
    ) -> MigrateResult<()> {
        match direction {
            Direction::Up => {
                let record = MigrationRecord::applied(migration, elapsed_ms(started));
                self.store.mark_applied(self.db(), &record).await
            }
            Direction::Down => {
                self.store
                    .mark_rolled_back(self.db(), migration.version())
                    .await
            }
        }
    }

    async fn record_failure(&self, migration: &Migration, direction: Direction, message: &str) {
        if let Err(err) = self
            .store
            .record_failure(self.db(), migration, direction, message)
            .await
        {
            warn!(
                version = %migration.version(),
                error = %err,
                "Failed to record migration failure"
            );
        }
    }
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("dialect", &self.adapter.dialect())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fail if any applied migration's definition has changed.
///
/// Ledger rows without a definition are only logged here; a rollback that
/// needs their down SQL fails separately.
fn verify_integrity(migrations: &[Migration], applied: &[MigrationRecord]) -> MigrateResult<()> {
    let by_version: HashMap<&str, &Migration> =
        migrations.iter().map(|m| (m.version(), m)).collect();

    for record in applied {
        match by_version.get(record.version.as_str()) {
            Some(migration) => {
                if !checksum::verify(&record.checksum, migration) {
                    return Err(MigrationError::ChecksumMismatch {
                        version: record.version.clone(),
                        expected: record.checksum.clone(),
                        actual: migration.checksum().to_string(),
                    });
                }
            }
            None => warn!(
                version = %record.version,
                "Applied migration has no definition in the repository"
            ),
        }
    }
    Ok(())
}

fn sql_for(migration: &Migration, direction: Direction) -> &str {
    match direction {
        Direction::Up => migration.up_sql(),
        Direction::Down => migration.down_sql().unwrap_or_default(),
    }
}

/// Lowercase a migration name and collapse everything else to `_`.
fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_lowercase());
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    sanitized.trim_matches('_').to_string()
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterResult, Row, SqlValue, SqliteAdapter};
    use crate::dialect::Dialect;
    use crate::lock::InProcessLock;
    use crate::repository::{MemorySource, MigrationSource};
    use crate::schema::{FieldDefinition, SemanticType};

    /// SQLite that pretends it cannot roll back DDL.
    struct NonTransactional(SqliteAdapter);

    #[async_trait::async_trait]
    impl DatabaseAdapter for NonTransactional {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn supports_transactional_ddl(&self) -> bool {
            false
        }

        async fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<u64> {
            self.0.execute(sql, params).await
        }

        async fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<Vec<Row>> {
            self.0.query(sql, params).await
        }

        async fn begin_transaction(&self) -> AdapterResult<()> {
            self.0.begin_transaction().await
        }

        async fn commit(&self) -> AdapterResult<()> {
            self.0.commit().await
        }

        async fn rollback(&self) -> AdapterResult<()> {
            self.0.rollback().await
        }
    }

    fn create_table(version: &str, table: &str) -> Migration {
        Migration::new(
            version,
            format!("create_{}", table),
            format!("CREATE TABLE {} (id INTEGER PRIMARY KEY);", table),
            Some(format!("DROP TABLE {};", table)),
        )
    }

    fn broken(version: &str) -> Migration {
        Migration::new(
            version,
            "broken",
            "CREATE TABLEX nope (id INTEGER);",
            Some("SELECT 1;".to_string()),
        )
    }

    fn manager(
        adapter: Arc<dyn DatabaseAdapter>,
        source: Arc<MemorySource>,
        config: MigratorConfig,
    ) -> MigrationManager {
        MigrationManager::new(
            adapter,
            MigrationRepository::from_arc(source),
            Arc::new(SqlRecordStore::default()),
            Arc::new(InProcessLock::new()),
            config,
        )
    }

    async fn sqlite() -> Arc<SqliteAdapter> {
        Arc::new(SqliteAdapter::open_in_memory().await.unwrap())
    }

    async fn table_exists(db: &dyn DatabaseAdapter, table: &str) -> bool {
        !db.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::from(table)],
        )
        .await
        .unwrap()
        .is_empty()
    }

    async fn applied_versions(db: &dyn DatabaseAdapter) -> Vec<String> {
        SqlRecordStore::default()
            .list_applied(db)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect()
    }

    #[tokio::test]
    async fn test_migrate_applies_in_version_order() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            Migration::new(
                "20240102_000000",
                "add_posts",
                "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users (id));",
                Some("DROP TABLE posts;".to_string()),
            ),
            create_table("20240101_000000", "users"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());

        let report = manager.migrate(None).await.unwrap();
        let versions: Vec<&str> = report.outcomes.iter().map(|o| o.version.as_str()).collect();
        assert_eq!(versions, vec!["20240101_000000", "20240102_000000"]);
        assert!(report.is_success());
        assert_eq!(report.applied_count(), 2);
        assert!(report.outcomes.iter().all(|o| o.state == MigrationState::Applied));
        assert_eq!(
            applied_versions(db.as_ref()).await,
            vec!["20240101_000000", "20240102_000000"]
        );

        let again = manager.migrate(None).await.unwrap();
        assert!(again.outcomes.is_empty());
        assert_eq!(again.summary(), "No pending migrations");
    }

    #[tokio::test]
    async fn test_failure_stops_the_run() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            broken("20240102_000000"),
            create_table("20240103_000000", "c"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());

        let report = manager.migrate(None).await.unwrap();
        assert_eq!(report.summary(), "1 applied, 1 failed, 1 not attempted");
        let failed = report.failed().unwrap();
        assert_eq!(failed.version, "20240102_000000");
        assert_eq!(failed.state, MigrationState::Failed);
        assert_eq!(report.outcomes[2].state, MigrationState::Pending);
        assert!(!report.outcomes[2].attempted);

        assert_eq!(applied_versions(db.as_ref()).await, vec!["20240101_000000"]);
        assert!(!table_exists(db.as_ref(), "c").await);

        let record = SqlRecordStore::default()
            .get(db.as_ref(), "20240102_000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.error_message.is_some());

        match report.into_result().unwrap_err() {
            MigrationError::Execution {
                version,
                phase,
                progress,
                ..
            } => {
                assert_eq!(version, "20240102_000000");
                assert_eq!(phase, Direction::Up);
                assert_eq!(
                    progress,
                    BatchProgress {
                        succeeded: 1,
                        not_attempted: 1
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_edited_migration_blocks_new_work() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([create_table(
            "20240101_000000",
            "a",
        )]));
        let manager = manager(db.clone(), source.clone(), MigratorConfig::default());
        manager.migrate(None).await.unwrap();

        source.replace(Migration::new(
            "20240101_000000",
            "create_a",
            "CREATE TABLE a (id INTEGER PRIMARY KEY, extra TEXT);",
            Some("DROP TABLE a;".to_string()),
        ));
        source.push(create_table("20240102_000000", "b"));

        let err = manager.migrate(None).await.unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { ref version, .. } if version == "20240101_000000"));
        assert!(!table_exists(db.as_ref(), "b").await);
        assert_eq!(applied_versions(db.as_ref()).await, vec!["20240101_000000"]);
    }

    #[tokio::test]
    async fn test_migrate_to_target() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            create_table("20240102_000000", "b"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());

        let report = manager.migrate(Some("20240101_000000")).await.unwrap();
        assert_eq!(report.applied_count(), 1);
        assert!(!table_exists(db.as_ref(), "b").await);

        let err = manager.migrate(Some("20990101_000000")).await.unwrap_err();
        assert!(matches!(err, MigrationError::NotFound(_)));

        let plan = manager.plan(None).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].version(), "20240102_000000");
    }

    #[tokio::test]
    async fn test_rollback_runs_newest_first() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            create_table("20240102_000000", "b"),
            create_table("20240103_000000", "c"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());
        manager.migrate(None).await.unwrap();

        let report = manager.rollback("20240101_000000").await.unwrap();
        let versions: Vec<&str> = report.outcomes.iter().map(|o| o.version.as_str()).collect();
        assert_eq!(versions, vec!["20240103_000000", "20240102_000000"]);
        assert_eq!(report.summary(), "2 rolled back, 0 failed, 0 not attempted");
        assert!(report.outcomes.iter().all(|o| o.state == MigrationState::RolledBack));
        assert!(table_exists(db.as_ref(), "a").await);
        assert!(!table_exists(db.as_ref(), "b").await);
        assert_eq!(applied_versions(db.as_ref()).await, vec!["20240101_000000"]);

        let record = SqlRecordStore::default()
            .get(db.as_ref(), "20240103_000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::RolledBack);

        // Rolled back migrations are pending again.
        let plan = manager.plan(None).await.unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_steps() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            create_table("20240102_000000", "b"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());
        manager.migrate(None).await.unwrap();

        let report = manager.rollback_steps(1).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].version, "20240102_000000");
        assert_eq!(applied_versions(db.as_ref()).await, vec!["20240101_000000"]);
    }

    #[tokio::test]
    async fn test_rollback_requires_down_sql() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            Migration::new(
                "20240102_000000",
                "seed",
                "INSERT INTO a (id) VALUES (1);",
                None,
            ),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());
        manager.migrate(None).await.unwrap();

        let err = manager.rollback("0").await.unwrap_err();
        assert!(matches!(err, MigrationError::MalformedMigration { ref version, .. } if version == "20240102_000000"));
        assert!(table_exists(db.as_ref(), "a").await);
        assert_eq!(applied_versions(db.as_ref()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_mode_reverts_the_whole_run() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            broken("20240102_000000"),
            create_table("20240103_000000", "c"),
        ]));
        let config = MigratorConfig::default().transaction_mode(TransactionMode::Batch);
        let manager = manager(db.clone(), source, config);

        let report = manager.migrate(None).await.unwrap();
        assert!(report.outcomes[0].reverted);
        assert_eq!(report.applied_count(), 0);
        assert_eq!(report.reverted_count(), 1);
        assert_eq!(
            report.summary(),
            "0 applied, 1 failed, 1 not attempted, 1 reverted"
        );
        assert!(!table_exists(db.as_ref(), "a").await);
        assert!(applied_versions(db.as_ref()).await.is_empty());

        let record = SqlRecordStore::default()
            .get(db.as_ref(), "20240102_000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn test_batch_mode_commits_on_success() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            create_table("20240102_000000", "b"),
        ]));
        let config = MigratorConfig::default().transaction_mode(TransactionMode::Batch);
        let manager = manager(db.clone(), source, config);

        let report = manager.migrate(None).await.unwrap();
        assert_eq!(report.applied_count(), 2);
        assert!(table_exists(db.as_ref(), "b").await);
        assert_eq!(applied_versions(db.as_ref()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_is_compensated_without_transactional_ddl() {
        let db = Arc::new(NonTransactional(
            SqliteAdapter::open_in_memory().await.unwrap(),
        ));
        let source = Arc::new(MemorySource::with_migrations([Migration::new(
            "20240101_000000",
            "two_steps",
            "CREATE TABLE a (id INTEGER);\nCREATE TABLEX b (id INTEGER);",
            Some("DROP TABLE a;".to_string()),
        )]));
        let manager = manager(db.clone(), source, MigratorConfig::default());

        let report = manager.migrate(None).await.unwrap();
        let failed = report.failed().unwrap();
        assert_eq!(failed.compensation, Some(Compensation::Applied));
        assert!(!table_exists(db.as_ref(), "a").await);
        assert!(applied_versions(db.as_ref()).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_mode_falls_back_without_transactional_ddl() {
        let db = Arc::new(NonTransactional(
            SqliteAdapter::open_in_memory().await.unwrap(),
        ));
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            broken("20240102_000000"),
        ]));
        let config = MigratorConfig::default().transaction_mode(TransactionMode::Batch);
        let manager = manager(db.clone(), source, config);

        let report = manager.migrate(None).await.unwrap();
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.reverted_count(), 0);
        assert!(table_exists(db.as_ref(), "a").await);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_boundary() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([
            create_table("20240101_000000", "a"),
            create_table("20240102_000000", "b"),
        ]));
        let manager = manager(db.clone(), source, MigratorConfig::default());
        manager.cancellation_token().cancel();

        let report = manager.migrate(None).await.unwrap();
        assert!(report.cancelled);
        assert!(!report.is_success());
        assert_eq!(report.not_attempted_count(), 2);
        assert_eq!(
            report.summary(),
            "0 applied, 0 failed, 2 not attempted (cancelled)"
        );
        assert!(!table_exists(db.as_ref(), "a").await);
    }

    #[tokio::test]
    async fn test_held_lock_fails_fast() {
        let db = sqlite().await;
        let lock = Arc::new(InProcessLock::new());
        let manager = MigrationManager::new(
            db.clone(),
            MigrationRepository::new(MemorySource::with_migrations([create_table(
                "20240101_000000",
                "a",
            )])),
            Arc::new(SqlRecordStore::default()),
            lock.clone(),
            MigratorConfig::default(),
        );

        let shared: Arc<dyn DatabaseAdapter> = db.clone();
        let guard = lock.acquire(&shared, None).await.unwrap();
        let err = manager.migrate(None).await.unwrap_err();
        assert!(matches!(err, MigrationError::LockAcquisition(_)));
        assert!(!table_exists(db.as_ref(), "a").await);

        lock.release(&shared, guard).await.unwrap();
        assert_eq!(manager.migrate(None).await.unwrap().applied_count(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_pending_and_drift() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([create_table(
            "20240101_000000",
            "a",
        )]));
        let manager = manager(db.clone(), source.clone(), MigratorConfig::default());
        manager.migrate(None).await.unwrap();

        source.replace(Migration::new(
            "20240101_000000",
            "create_a",
            "CREATE TABLE a (id BIGINT PRIMARY KEY);",
            Some("DROP TABLE a;".to_string()),
        ));
        source.push(create_table("20240102_000000", "b"));

        let status = manager.status().await.unwrap();
        assert_eq!(status.migrations.len(), 2);
        assert_eq!(status.applied_count(), 1);
        assert_eq!(status.pending_count(), 1);
        assert_eq!(status.migrations[0].checksum_matches, Some(false));
        assert!(status.migrations[0].applied_at.is_some());
        assert_eq!(status.migrations[1].status, RecordStatus::Pending);
        assert_eq!(status.drifted().len(), 1);
    }

    #[tokio::test]
    async fn test_create_migration_versions_increase() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::new());
        let manager = manager(db, source, MigratorConfig::default());

        let first = manager
            .create_migration("Add Users!", "CREATE TABLE users (id INTEGER);", None)
            .await
            .unwrap();
        let second = manager
            .create_migration("add posts", "CREATE TABLE posts (id INTEGER);", None)
            .await
            .unwrap();
        assert_eq!(first.name(), "add_users");
        assert!(second.version() > first.version());

        let err = manager.create_migration("empty", "  ", None).await.unwrap_err();
        assert!(matches!(err, MigrationError::MalformedMigration { .. }));
        let err = manager
            .create_migration("!!!", "SELECT 1;", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MalformedMigration { .. }));
    }

    fn blog_models() -> Vec<ModelDefinition> {
        vec![
            ModelDefinition::new("Post")
                .table_name("posts")
                .field(FieldDefinition::primary_key("id"))
                .field(FieldDefinition::new("title", SemanticType::String).max_length(200))
                .field(FieldDefinition::foreign_key("author_id", "users", "id").indexed()),
            ModelDefinition::new("User")
                .table_name("users")
                .field(FieldDefinition::primary_key("id"))
                .field(FieldDefinition::unique_field("email", SemanticType::String)),
        ]
    }

    #[tokio::test]
    async fn test_models_to_applied_schema_and_back() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::new());
        let manager = manager(db.clone(), source, MigratorConfig::default());

        let (migration, snapshot) = manager
            .create_migration_from_models("init", &SchemaSnapshot::new(), &blog_models())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        let users_at = migration.up_sql().find("CREATE TABLE \"users\"").unwrap();
        let posts_at = migration.up_sql().find("CREATE TABLE \"posts\"").unwrap();
        assert!(users_at < posts_at);

        let report = manager.migrate(None).await.unwrap();
        assert_eq!(report.applied_count(), 1);
        assert!(table_exists(db.as_ref(), "users").await);
        assert!(table_exists(db.as_ref(), "posts").await);

        manager.rollback("0").await.unwrap();
        assert!(!table_exists(db.as_ref(), "users").await);
        assert!(!table_exists(db.as_ref(), "posts").await);

        let err = manager
            .create_migration_from_snapshots("noop", &snapshot, &snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NoChanges));
    }

    #[tokio::test]
    async fn test_destructive_changes_need_opt_in() {
        let db = sqlite().await;
        let old = build_snapshot(&blog_models()).unwrap();
        let new = SchemaSnapshot::new();

        let cautious = manager(db.clone(), Arc::new(MemorySource::new()), MigratorConfig::default());
        assert!(cautious.preview_sql(&old, &new).unwrap().is_empty());

        let permissive = manager(
            db,
            Arc::new(MemorySource::new()),
            MigratorConfig::default().allow_destructive(true),
        );
        let preview = permissive.preview_sql(&old, &new).unwrap();
        assert!(preview.summary().contains("drop_table: 2"));
        assert!(preview.sql.up.contains("DROP TABLE IF EXISTS \"posts\""));
    }

    #[tokio::test]
    async fn test_validate_models_rejects_cycles() {
        let db = sqlite().await;
        let manager = manager(db, Arc::new(MemorySource::new()), MigratorConfig::default());
        assert_eq!(manager.validate_models(&blog_models()).unwrap().len(), 2);

        let cyclic = vec![
            ModelDefinition::new("A")
                .field(FieldDefinition::primary_key("id"))
                .field(FieldDefinition::foreign_key("b_id", "b", "id")),
            ModelDefinition::new("B")
                .field(FieldDefinition::primary_key("id"))
                .field(FieldDefinition::foreign_key("a_id", "a", "id")),
        ];
        assert!(matches!(
            manager.validate_models(&cyclic).unwrap_err(),
            MigrationError::CyclicDependency { .. }
        ));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Add Users!"), "add_users");
        assert_eq!(sanitize_name("  create--orders table "), "create_orders_table");
        assert_eq!(sanitize_name("???"), "");
    }

    /// Source whose load never completes.
    struct StalledSource;

    #[async_trait::async_trait]
    impl MigrationSource for StalledSource {
        async fn load_all(&self) -> MigrateResult<Vec<Migration>> {
            std::future::pending().await
        }

        async fn save(&self, _migration: &Migration) -> MigrateResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dropped_run_releases_table_lock() {
        let db = sqlite().await;
        let table_lock = || Arc::new(TableLock::default().retry_interval(Duration::from_millis(10)));

        let stalled = MigrationManager::new(
            db.clone(),
            MigrationRepository::new(StalledSource),
            Arc::new(SqlRecordStore::default()),
            table_lock(),
            MigratorConfig::default(),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(50), stalled.migrate(None)).await;
        assert!(timed_out.is_err());

        let manager = MigrationManager::new(
            db.clone(),
            MigrationRepository::new(MemorySource::with_migrations([create_table(
                "20240101_000000",
                "a",
            )])),
            Arc::new(SqlRecordStore::default()),
            table_lock(),
            MigratorConfig::default().lock_timeout(Some(Duration::from_secs(2))),
        );
        let report = manager.migrate(None).await.unwrap();
        assert_eq!(report.applied_count(), 1);

        let rows = db
            .query("SELECT holder FROM \"_strata_migrations_lock\"", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_body_runs_as_one_statement() {
        let db = sqlite().await;
        let source = Arc::new(MemorySource::with_migrations([Migration::new(
            "20240101_000000",
            "audit_trigger",
            "CREATE TABLE t (id INTEGER PRIMARY KEY);\n\
             CREATE TABLE log (id INTEGER);\n\
             CREATE TRIGGER tr AFTER INSERT ON t BEGIN\n\
             \x20   INSERT INTO log (id) VALUES (NEW.id);\n\
             END;\n",
            Some("DROP TRIGGER tr;\nDROP TABLE log;\nDROP TABLE t;".to_string()),
        )]));
        let manager = manager(db.clone(), source, MigratorConfig::default());

        manager.migrate(None).await.unwrap().into_result().unwrap();
        db.execute("INSERT INTO t (id) VALUES (7)", &[]).await.unwrap();
        let rows = db.query("SELECT id FROM log", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id").and_then(|v| v.as_i64()), Some(7));

        manager.rollback_steps(1).await.unwrap().into_result().unwrap();
        assert!(!table_exists(db.as_ref(), "log").await);
    }
}
