//! Coordination locks that keep migration runs exclusive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::adapter::{DatabaseAdapter, SqlValue};
use crate::error::{MigrateResult, MigrationError};

/// Default name of the lock table.
pub const DEFAULT_LOCK_TABLE: &str = "_strata_migrations_lock";

const LOCK_ROW_ID: i64 = 1;

/// Proof that a lock is held. Hand it back to
/// [`CoordinationLock::release`] when the run ends.
///
/// A guard dropped without being released (for example because the future
/// running the migration was dropped) falls back to releasing the lock in the
/// background on the current Tokio runtime.
pub struct LockGuard {
    holder: String,
    permit: Option<OwnedMutexGuard<()>>,
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    fn new(holder: String) -> Self {
        Self {
            holder,
            permit: None,
            release_fn: None,
        }
    }

    /// Identifier of the holder.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Whether dropping the guard would release the lock in the background.
    pub fn releases_on_drop(&self) -> bool {
        self.release_fn.is_some()
    }

    fn disarm(&mut self) {
        self.release_fn = None;
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder", &self.holder)
            .field("in_process", &self.permit.is_some())
            .field("releases_on_drop", &self.releases_on_drop())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release_fn.take() {
            warn!(holder = %self.holder, "Migration lock dropped without release");
            release();
        }
    }
}

/// Mutual exclusion for migration runs.
#[async_trait::async_trait]
pub trait CoordinationLock: Send + Sync {
    /// Acquire the lock.
    ///
    /// With `wait = None` a held lock fails immediately with
    /// [`MigrationError::LockAcquisition`]; otherwise acquisition is retried
    /// until the timeout elapses.
    async fn acquire(
        &self,
        db: &Arc<dyn DatabaseAdapter>,
        wait: Option<Duration>,
    ) -> MigrateResult<LockGuard>;

    /// Release a lock obtained from [`CoordinationLock::acquire`].
    async fn release(&self, db: &Arc<dyn DatabaseAdapter>, guard: LockGuard)
    -> MigrateResult<()>;
}

/// Lock stored as a single row in the target database.
///
/// Any process that can reach the database sees the row, so this excludes
/// runs across processes and hosts.
#[derive(Debug, Clone)]
pub struct TableLock {
    table: String,
    retry_interval: Duration,
}

impl TableLock {
    /// Use the given lock table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            retry_interval: Duration::from_millis(250),
        }
    }

    /// Set the pause between attempts while waiting.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    async fn ensure_table(&self, db: &dyn DatabaseAdapter) -> MigrateResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             id INTEGER PRIMARY KEY,\n    \
             holder VARCHAR(255) NOT NULL,\n    \
             acquired_at VARCHAR(64) NOT NULL\n)",
            db.dialect().quote_ident(&self.table)
        );
        db.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn current_holder(&self, db: &dyn DatabaseAdapter) -> MigrateResult<Option<String>> {
        let dialect = db.dialect();
        let sql = format!(
            "SELECT holder, acquired_at FROM {} WHERE id = {}",
            dialect.quote_ident(&self.table),
            dialect.placeholder(1)
        );
        let rows = db.query(&sql, &[SqlValue::Integer(LOCK_ROW_ID)]).await?;
        Ok(rows.first().map(|row| {
            let holder = row.get("holder").and_then(|v| v.as_str()).unwrap_or("unknown");
            let since = row.get("acquired_at").and_then(|v| v.as_str()).unwrap_or("?");
            format!("{} (since {})", holder, since)
        }))
    }

    async fn try_insert(&self, db: &dyn DatabaseAdapter, holder: &str) -> MigrateResult<bool> {
        let dialect = db.dialect();
        let sql = format!(
            "INSERT INTO {} (id, holder, acquired_at) VALUES ({}, {}, {})",
            dialect.quote_ident(&self.table),
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3)
        );
        let params = [
            SqlValue::Integer(LOCK_ROW_ID),
            SqlValue::from(holder),
            SqlValue::from(Utc::now().to_rfc3339()),
        ];

        match db.execute(&sql, &params).await {
            Ok(_) => Ok(true),
            // A conflicting insert means someone holds the lock; anything
            // else is a real failure.
            Err(err) => match self.current_holder(db).await? {
                Some(_) => Ok(false),
                None => Err(err.into()),
            },
        }
    }

    fn delete_sql(&self, db: &dyn DatabaseAdapter) -> String {
        let dialect = db.dialect();
        format!(
            "DELETE FROM {} WHERE id = {} AND holder = {}",
            dialect.quote_ident(&self.table),
            dialect.placeholder(1),
            dialect.placeholder(2)
        )
    }

    /// Delete this holder's row from a spawned task, for guards that are
    /// dropped instead of released.
    fn background_release(
        &self,
        db: &Arc<dyn DatabaseAdapter>,
        holder: &str,
    ) -> Box<dyn FnOnce() + Send> {
        let db = Arc::clone(db);
        let sql = self.delete_sql(db.as_ref());
        let holder = holder.to_string();

        Box::new(move || {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(holder = %holder, "No runtime to release the migration lock; remove the row by hand");
                return;
            };
            handle.spawn(async move {
                // The dropped run may have left its transaction open, which
                // would swallow the delete.
                let _ = db.rollback().await;
                let params = [SqlValue::Integer(LOCK_ROW_ID), SqlValue::from(holder.as_str())];
                match db.execute(&sql, &params).await {
                    Ok(_) => debug!(holder = %holder, "Released abandoned migration lock"),
                    Err(err) => {
                        warn!(holder = %holder, error = %err, "Failed to release abandoned migration lock")
                    }
                }
            });
        })
    }
}

impl Default for TableLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TABLE)
    }
}

#[async_trait::async_trait]
impl CoordinationLock for TableLock {
    async fn acquire(
        &self,
        db: &Arc<dyn DatabaseAdapter>,
        wait: Option<Duration>,
    ) -> MigrateResult<LockGuard> {
        let shared = db;
        let db = db.as_ref();
        self.ensure_table(db).await?;

        let holder = format!("{}@{}", uuid::Uuid::new_v4(), std::process::id());
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            if self.try_insert(db, &holder).await? {
                debug!(holder = %holder, table = %self.table, "Acquired migration lock");
                let mut guard = LockGuard::new(holder);
                guard.release_fn = Some(self.background_release(shared, guard.holder()));
                return Ok(guard);
            }

            let expired = deadline.is_none_or(|d| Instant::now() >= d);
            if expired {
                let current = self
                    .current_holder(db)
                    .await?
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(MigrationError::lock_failed(format!(
                    "another migration run holds the lock: {}",
                    current
                )));
            }

            trace!(table = %self.table, "Migration lock busy, retrying");
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn release(
        &self,
        db: &Arc<dyn DatabaseAdapter>,
        mut guard: LockGuard,
    ) -> MigrateResult<()> {
        guard.disarm();
        let sql = self.delete_sql(db.as_ref());
        let deleted = db
            .execute(
                &sql,
                &[SqlValue::Integer(LOCK_ROW_ID), SqlValue::from(guard.holder())],
            )
            .await?;
        if deleted == 0 {
            return Err(MigrationError::lock_failed(format!(
                "lock was no longer held by {}",
                guard.holder()
            )));
        }
        debug!(holder = %guard.holder(), "Released migration lock");
        Ok(())
    }
}

/// Lock shared by runs inside one process.
#[derive(Debug, Clone, Default)]
pub struct InProcessLock {
    mutex: Arc<Mutex<()>>,
}

impl InProcessLock {
    /// Create a new, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CoordinationLock for InProcessLock {
    async fn acquire(
        &self,
        _db: &Arc<dyn DatabaseAdapter>,
        wait: Option<Duration>,
    ) -> MigrateResult<LockGuard> {
        let permit = match wait {
            None => self
                .mutex
                .clone()
                .try_lock_owned()
                .map_err(|_| MigrationError::lock_failed("another migration run is in progress"))?,
            Some(wait) => tokio::time::timeout(wait, self.mutex.clone().lock_owned())
                .await
                .map_err(|_| {
                    MigrationError::lock_failed(format!(
                        "timed out after {:?} waiting for another migration run",
                        wait
                    ))
                })?,
        };

        let mut guard = LockGuard::new(format!("process-{}", std::process::id()));
        guard.permit = Some(permit);
        Ok(guard)
    }

    async fn release(
        &self,
        _db: &Arc<dyn DatabaseAdapter>,
        guard: LockGuard,
    ) -> MigrateResult<()> {
        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SqliteAdapter;

    async fn sqlite() -> Arc<dyn DatabaseAdapter> {
        Arc::new(SqliteAdapter::open_in_memory().await.unwrap())
    }

    async fn lock_rows(db: &Arc<dyn DatabaseAdapter>) -> usize {
        db.query("SELECT holder FROM \"_strata_migrations_lock\"", &[])
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_table_lock_excludes_second_holder() {
        let db = sqlite().await;
        let lock = TableLock::default();

        let guard = lock.acquire(&db, None).await.unwrap();
        let err = lock.acquire(&db, None).await.unwrap_err();
        assert!(matches!(err, MigrationError::LockAcquisition(_)));
        assert!(err.to_string().contains(guard.holder()));

        lock.release(&db, guard).await.unwrap();
        let again = lock.acquire(&db, None).await.unwrap();
        lock.release(&db, again).await.unwrap();
    }

    #[tokio::test]
    async fn test_table_lock_wait_times_out() {
        let db = sqlite().await;
        let lock = TableLock::default().retry_interval(Duration::from_millis(10));

        let _guard = lock.acquire(&db, None).await.unwrap();
        let started = std::time::Instant::now();
        let err = lock
            .acquire(&db, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockAcquisition(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_release_of_stale_guard_fails() {
        let db = sqlite().await;
        let lock = TableLock::default();
        let guard = lock.acquire(&db, None).await.unwrap();
        db.execute("DELETE FROM \"_strata_migrations_lock\"", &[])
            .await
            .unwrap();
        assert!(lock.release(&db, guard).await.is_err());
    }

    #[tokio::test]
    async fn test_in_process_lock() {
        let db = sqlite().await;
        let lock = InProcessLock::new();

        let guard = lock.acquire(&db, None).await.unwrap();
        assert!(lock.acquire(&db, None).await.is_err());
        assert!(
            lock.acquire(&db, Some(Duration::from_millis(20)))
                .await
                .is_err()
        );

        lock.release(&db, guard).await.unwrap();
        let guard = lock.acquire(&db, Some(Duration::from_millis(20))).await.unwrap();
        lock.release(&db, guard).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_table_guard_releases_in_background() {
        let db = sqlite().await;
        let lock = TableLock::default().retry_interval(Duration::from_millis(10));

        let guard = lock.acquire(&db, None).await.unwrap();
        assert!(guard.releases_on_drop());
        drop(guard);

        let again = lock
            .acquire(&db, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(lock_rows(&db).await, 1);
        lock.release(&db, again).await.unwrap();
        assert_eq!(lock_rows(&db).await, 0);
    }

    #[tokio::test]
    async fn test_released_guard_does_not_release_again() {
        let db = sqlite().await;
        let lock = TableLock::default();

        let first = lock.acquire(&db, None).await.unwrap();
        lock.release(&db, first).await.unwrap();
        let second = lock.acquire(&db, None).await.unwrap();

        // Give a stray background release every chance to run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(lock_rows(&db).await, 1);
        assert!(lock.acquire(&db, None).await.is_err());
        lock.release(&db, second).await.unwrap();
    }
}
