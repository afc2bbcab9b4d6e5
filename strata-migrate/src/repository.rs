//! Migration definitions and where they come from.
//!
//! Migrations are stored as directories with `up.sql` and `down.sql` files:
//!
//! ```text
//! migrations/
//! ├── 20240101_120000_create_users/
//! │   ├── up.sql
//! │   └── down.sql
//! └── 20240102_090000_add_orders/
//!     ├── up.sql
//!     └── down.sql
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::migration::{Migration, is_timestamp_version};

/// A place migration definitions are read from and written to.
#[async_trait::async_trait]
pub trait MigrationSource: Send + Sync {
    /// Every definition, in no particular order.
    async fn load_all(&self) -> MigrateResult<Vec<Migration>>;

    /// Persist a new definition.
    async fn save(&self, migration: &Migration) -> MigrateResult<()>;
}

/// Migrations stored on the filesystem.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    migrations_dir: PathBuf,
}

impl DirectorySource {
    /// Create a source over a directory.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Directory a migration is written to.
    pub fn migration_path(&self, migration: &Migration) -> PathBuf {
        self.migrations_dir.join(migration.full_name())
    }

    async fn read_migration(&self, path: &Path) -> MigrateResult<Option<Migration>> {
        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if dir_name.starts_with('.') {
            return Ok(None);
        }

        let (version, name) = parse_migration_name(dir_name);

        let up_path = path.join("up.sql");
        let down_path = path.join("down.sql");

        // A missing up.sql surfaces as a malformed migration when loaded.
        let up_sql = if up_path.exists() {
            tokio::fs::read_to_string(&up_path).await?
        } else {
            String::new()
        };

        let down_sql = if down_path.exists() {
            Some(tokio::fs::read_to_string(&down_path).await?)
        } else {
            None
        };

        Ok(Some(Migration::new(version, name, up_sql, down_sql)))
    }
}

#[async_trait::async_trait]
impl MigrationSource for DirectorySource {
    async fn load_all(&self) -> MigrateResult<Vec<Migration>> {
        let mut migrations = Vec::new();

        if !self.migrations_dir.exists() {
            return Ok(migrations);
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(migration) = self.read_migration(&path).await? {
                migrations.push(migration);
            }
        }

        debug!(
            dir = %self.migrations_dir.display(),
            count = migrations.len(),
            "Loaded migration files"
        );
        Ok(migrations)
    }

    async fn save(&self, migration: &Migration) -> MigrateResult<()> {
        let dir = self.migration_path(migration);
        if dir.exists() {
            return Err(MigrationError::DuplicateVersion(migration.version().to_string()));
        }

        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("up.sql"), migration.up_sql()).await?;
        if let Some(down) = migration.down_sql() {
            tokio::fs::write(dir.join("down.sql"), down).await?;
        }

        debug!(path = %dir.display(), "Wrote migration");
        Ok(())
    }
}

/// Split `<version>_<name>` into its parts.
///
/// Generated versions are `YYYYMMDD_HHMMSS`, which itself contains an
/// underscore; any other scheme splits at the first underscore.
fn parse_migration_name(dir_name: &str) -> (String, String) {
    if let Some(prefix) = dir_name.get(..15) {
        if is_timestamp_version(prefix) {
            let name = dir_name[15..].trim_start_matches('_');
            return (prefix.to_string(), name.to_string());
        }
    }

    match dir_name.split_once('_') {
        Some((version, name)) => (version.to_string(), name.to_string()),
        None => (dir_name.to_string(), String::new()),
    }
}

/// Migrations held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    migrations: RwLock<Vec<Migration>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source holding the given migrations.
    pub fn with_migrations(migrations: impl IntoIterator<Item = Migration>) -> Self {
        Self {
            migrations: RwLock::new(migrations.into_iter().collect()),
        }
    }

    /// Add a migration.
    pub fn push(&self, migration: Migration) {
        self.migrations.write().push(migration);
    }

    /// Replace the definition stored under the same version.
    pub fn replace(&self, migration: Migration) {
        let mut migrations = self.migrations.write();
        migrations.retain(|m| m.version() != migration.version());
        migrations.push(migration);
    }
}

#[async_trait::async_trait]
impl MigrationSource for MemorySource {
    async fn load_all(&self) -> MigrateResult<Vec<Migration>> {
        Ok(self.migrations.read().clone())
    }

    async fn save(&self, migration: &Migration) -> MigrateResult<()> {
        self.push(migration.clone());
        Ok(())
    }
}

/// Loads, validates and orders migration definitions.
#[derive(Clone)]
pub struct MigrationRepository {
    source: Arc<dyn MigrationSource>,
}

impl MigrationRepository {
    /// Wrap a source.
    pub fn new(source: impl MigrationSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Wrap a shared source.
    pub fn from_arc(source: Arc<dyn MigrationSource>) -> Self {
        Self { source }
    }

    /// Every migration, ascending by version.
    ///
    /// Fails on duplicate versions and on migrations without up SQL.
    pub async fn load(&self) -> MigrateResult<Vec<Migration>> {
        let mut migrations = self.source.load_all().await?;

        for migration in &migrations {
            if migration.up_sql().trim().is_empty() {
                return Err(MigrationError::malformed(
                    migration.version(),
                    "up SQL is missing",
                ));
            }
        }

        migrations.sort_by(|a, b| a.version().cmp(b.version()));
        if let Some(pair) = migrations
            .windows(2)
            .find(|pair| pair[0].version() == pair[1].version())
        {
            return Err(MigrationError::DuplicateVersion(pair[0].version().to_string()));
        }

        Ok(migrations)
    }

    /// Look up one migration by version.
    pub async fn find(&self, version: &str) -> MigrateResult<Migration> {
        self.load()
            .await?
            .into_iter()
            .find(|m| m.version() == version)
            .ok_or_else(|| MigrationError::NotFound(version.to_string()))
    }

    /// Highest known version.
    pub async fn latest_version(&self) -> MigrateResult<Option<String>> {
        Ok(self.load().await?.last().map(|m| m.version().to_string()))
    }

    /// Persist a new migration, refusing a version that already exists.
    pub async fn save(&self, migration: &Migration) -> MigrateResult<()> {
        if self
            .load()
            .await?
            .iter()
            .any(|m| m.version() == migration.version())
        {
            return Err(MigrationError::DuplicateVersion(migration.version().to_string()));
        }
        self.source.save(migration).await
    }

    /// Fail unless the migration can be rolled back.
    pub fn ensure_reversible(migration: &Migration) -> MigrateResult<()> {
        if migration.is_reversible() {
            Ok(())
        } else {
            Err(MigrationError::malformed(
                migration.version(),
                "down SQL is missing but a rollback was requested",
            ))
        }
    }
}

impl std::fmt::Debug for MigrationRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRepository").finish_non_exhaustive()
    }
}
