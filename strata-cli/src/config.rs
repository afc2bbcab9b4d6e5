//! CLI configuration handling.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use strata_migrate::Dialect;
use strata_migrate::lock::DEFAULT_LOCK_TABLE;
use strata_migrate::manager::{MigratorConfig, TransactionMode};
use strata_migrate::record::DEFAULT_HISTORY_TABLE;

use crate::error::{CliError, CliResult};

/// Default config file name (lives in project root)
pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Default migrations directory (relative to project root)
pub const MIGRATIONS_DIR: &str = "migrations";

/// Default models file (relative to project root)
pub const MODELS_FILE: &str = "models.toml";

/// Default snapshot file (relative to project root)
pub const SNAPSHOT_FILE: &str = "migrations/.snapshot.json";

/// Strata CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Migration configuration
    pub migrations: MigrationConfig,

    /// Model configuration
    pub models: ModelsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> CliResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> CliResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// SQL dialect of the configured provider
    pub fn dialect(&self) -> CliResult<Dialect> {
        self.database
            .provider
            .parse()
            .map_err(CliError::Config)
    }

    /// Engine configuration with paths resolved against `base`
    pub fn migrator_config(&self, base: &Path) -> MigratorConfig {
        let m = &self.migrations;
        MigratorConfig::new()
            .migrations_dir(base.join(&m.directory))
            .history_table(&m.table_name)
            .lock_table(&m.lock_table)
            .transaction_mode(m.transaction_mode)
            .lock_timeout(m.lock_timeout_secs.map(Duration::from_secs))
            .allow_destructive(m.allow_destructive)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database provider (postgresql, mysql, sqlite)
    pub provider: String,

    /// Database connection URL
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            url: None,
        }
    }
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory for migration files
    pub directory: String,

    /// Migration table name
    pub table_name: String,

    /// Lock table name
    pub lock_table: String,

    /// `per_migration` or `batch`
    pub transaction_mode: TransactionMode,

    /// Allow generated migrations to drop tables and columns
    pub allow_destructive: bool,

    /// Seconds to wait for another run to release the lock
    pub lock_timeout_secs: Option<u64>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: MIGRATIONS_DIR.to_string(),
            table_name: DEFAULT_HISTORY_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            transaction_mode: TransactionMode::default(),
            allow_destructive: false,
            lock_timeout_secs: None,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Path to the models file
    pub path: PathBuf,

    /// Path to the snapshot of the last generated schema
    pub snapshot: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(MODELS_FILE),
            snapshot: PathBuf::from(SNAPSHOT_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(
            r#"
            [database]
            provider = "postgresql"
            url = "postgres://localhost/app"

            [migrations]
            directory = "db/migrations"
            transaction_mode = "batch"
            lock_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.dialect().unwrap(), Dialect::Postgres);
        assert_eq!(config.migrations.table_name, "_strata_migrations");

        let migrator = config.migrator_config(Path::new("/srv/app"));
        assert_eq!(migrator.migrations_dir, PathBuf::from("/srv/app/db/migrations"));
        assert_eq!(migrator.transaction_mode, TransactionMode::Batch);
        assert_eq!(migrator.lock_timeout, Some(Duration::from_secs(5)));
        assert!(!migrator.allow_destructive);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dialect().unwrap(), Dialect::Sqlite);
        assert_eq!(config.models.path, PathBuf::from("models.toml"));
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = Config::default();
        config.database.provider = "oracle".to_string();
        assert!(matches!(config.dialect(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.migrations.directory, MIGRATIONS_DIR);
        assert!(Config::load_or_default(&dir.path().join("missing.toml")).is_ok());
    }
}
