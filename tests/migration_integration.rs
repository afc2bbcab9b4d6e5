//! Integration tests for applying and reverting migrations.
//!
//! These tests run the full manager against an in-memory SQLite database.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use strata::migrate::{
    AdapterResult, DatabaseAdapter, Dialect, InProcessLock, MemorySource, Migration,
    MigrationError, MigrationManager, MigrationRepository, MigrationState, MigratorConfig,
    RecordStatus, Row, SqlRecordStore, SqlValue, SqliteAdapter,
};

/// SQLite adapter that remembers every statement it executes.
struct RecordingAdapter {
    inner: SqliteAdapter,
    executed: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    async fn new() -> Self {
        Self {
            inner: SqliteAdapter::open_in_memory().await.unwrap(),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|sql| sql.trim_start().starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DatabaseAdapter for RecordingAdapter {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<u64> {
        self.executed.lock().push(sql.to_string());
        self.inner.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    async fn begin_transaction(&self) -> AdapterResult<()> {
        self.inner.begin_transaction().await
    }

    async fn commit(&self) -> AdapterResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> AdapterResult<()> {
        self.inner.rollback().await
    }
}

fn manager(
    adapter: Arc<dyn DatabaseAdapter>,
    migrations: Vec<Migration>,
) -> (MigrationManager, Arc<MemorySource>) {
    let source = Arc::new(MemorySource::with_migrations(migrations));
    let manager = MigrationManager::new(
        adapter,
        MigrationRepository::from_arc(source.clone()),
        Arc::new(SqlRecordStore::new("_strata_migrations")),
        Arc::new(InProcessLock::new()),
        MigratorConfig::new(),
    );
    (manager, source)
}

fn users() -> Migration {
    Migration::new(
        "20240101_000000",
        "create_users",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);",
        Some("DROP TABLE users;".to_string()),
    )
}

fn posts() -> Migration {
    Migration::new(
        "20240102_000000",
        "create_posts",
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));",
        Some("DROP TABLE posts;".to_string()),
    )
}

async fn table_exists(adapter: &dyn DatabaseAdapter, name: &str) -> bool {
    let rows = adapter
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[SqlValue::from(name)],
        )
        .await
        .unwrap();
    !rows.is_empty()
}

/// Apply, check status, then roll everything back
#[tokio::test]
async fn test_full_round_trip() {
    let adapter = Arc::new(RecordingAdapter::new().await);
    let (manager, _) = manager(adapter.clone(), vec![posts(), users()]);

    let report = manager.migrate(None).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied_count(), 2);
    assert!(table_exists(adapter.as_ref(), "users").await);
    assert!(table_exists(adapter.as_ref(), "posts").await);

    let status = manager.status().await.unwrap();
    assert_eq!(status.applied_count(), 2);
    assert_eq!(status.pending_count(), 0);
    assert!(status.drifted().is_empty());

    let report = manager.rollback("19700101_000000").await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied_count(), 2);
    assert!(!table_exists(adapter.as_ref(), "users").await);
    assert!(!table_exists(adapter.as_ref(), "posts").await);

    let status = manager.status().await.unwrap();
    assert_eq!(status.applied_count(), 0);
    assert!(
        status
            .migrations
            .iter()
            .all(|m| m.status == RecordStatus::RolledBack)
    );
}

/// Migrations apply in version order and revert in reverse order
#[tokio::test]
async fn test_rollback_runs_newest_first() {
    let adapter = Arc::new(RecordingAdapter::new().await);
    let (manager, _) = manager(adapter.clone(), vec![users(), posts()]);

    manager.migrate(None).await.unwrap().into_result().unwrap();
    assert_eq!(
        adapter.statements_starting_with("CREATE TABLE users").len(),
        1
    );

    manager
        .rollback("19700101_000000")
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let drops = adapter.statements_starting_with("DROP TABLE");
    assert_eq!(drops, vec!["DROP TABLE posts", "DROP TABLE users"]);
}

/// Second migration fails: first stays applied, third is never started
#[tokio::test]
async fn test_failure_stops_the_run() {
    let adapter = Arc::new(RecordingAdapter::new().await);
    let broken = Migration::new("20240102_000000", "broken", "CREATE TABLE (", None);
    let never = Migration::new(
        "20240103_000000",
        "never",
        "CREATE TABLE never_run (id INTEGER);",
        None,
    );
    let (manager, _) = manager(adapter.clone(), vec![users(), broken, never]);

    let report = manager.migrate(None).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.applied_count(), 1);
    assert_eq!(report.not_attempted_count(), 1);

    let failed = report.failed().unwrap();
    assert_eq!(failed.version, "20240102_000000");
    assert_eq!(failed.state, MigrationState::Failed);
    assert!(!table_exists(adapter.as_ref(), "never_run").await);

    match report.into_result() {
        Err(MigrationError::Execution { progress, .. }) => {
            assert_eq!(progress.succeeded, 1);
            assert_eq!(progress.not_attempted, 1);
        }
        other => panic!("expected execution error, got {:?}", other),
    }

    let status = manager.status().await.unwrap();
    let statuses: Vec<_> = status.migrations.iter().map(|m| m.status).collect();
    assert_eq!(
        statuses,
        vec![
            RecordStatus::Applied,
            RecordStatus::Failed,
            RecordStatus::Pending
        ]
    );
}

/// Editing an applied migration blocks every later run before any SQL executes
#[tokio::test]
async fn test_edited_migration_is_refused() {
    let adapter = Arc::new(RecordingAdapter::new().await);
    let (manager, source) = manager(adapter.clone(), vec![users()]);
    manager.migrate(None).await.unwrap().into_result().unwrap();

    source.replace(Migration::new(
        "20240101_000000",
        "create_users",
        "CREATE TABLE users (id INTEGER PRIMARY KEY);",
        Some("DROP TABLE users;".to_string()),
    ));
    source.push(posts());

    let err = manager.migrate(None).await.unwrap_err();
    assert!(matches!(err, MigrationError::ChecksumMismatch { ref version, .. } if version == "20240101_000000"));
    assert!(!table_exists(adapter.as_ref(), "posts").await);

    let status = manager.status().await.unwrap();
    assert_eq!(status.drifted().len(), 1);
}

/// A migration without down SQL blocks the rollback before anything runs
#[tokio::test]
async fn test_irreversible_migration_blocks_rollback() {
    let adapter = Arc::new(RecordingAdapter::new().await);
    let seed = Migration::new(
        "20240102_000000",
        "seed",
        "INSERT INTO users (email) VALUES ('a@example.com');",
        None,
    );
    let (manager, _) = manager(adapter.clone(), vec![users(), seed]);
    manager.migrate(None).await.unwrap().into_result().unwrap();

    let err = manager.rollback_steps(2).await.unwrap_err();
    assert!(matches!(err, MigrationError::MalformedMigration { ref version, .. } if version == "20240102_000000"));
    assert!(table_exists(adapter.as_ref(), "users").await);

    let status = manager.status().await.unwrap();
    assert_eq!(status.applied_count(), 2);
}
