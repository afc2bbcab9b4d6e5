//! Migration definitions and run-time state.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum;

/// Format of generated migration versions (`YYYYMMDD_HHMMSS`).
pub const VERSION_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A versioned, reversible schema change.
///
/// Migrations are immutable: the checksum is computed once, at construction,
/// over the up/down SQL pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    version: String,
    name: String,
    up_sql: String,
    down_sql: Option<String>,
    checksum: String,
}

impl Migration {
    /// Create a new migration.
    pub fn new(
        version: impl Into<String>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        let up_sql = up_sql.into();
        let down_sql = down_sql.filter(|sql| !sql.trim().is_empty());
        let checksum = checksum::compute_parts(&up_sql, down_sql.as_deref());

        Self {
            version: version.into(),
            name: name.into(),
            up_sql,
            down_sql,
            checksum,
        }
    }

    /// Sortable version id.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SQL that applies the migration.
    pub fn up_sql(&self) -> &str {
        &self.up_sql
    }

    /// SQL that reverses the migration, if any.
    pub fn down_sql(&self) -> Option<&str> {
        self.down_sql.as_deref()
    }

    /// Checksum computed when the migration was created.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Check if this migration can be rolled back.
    pub fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }

    /// Get the full migration name (`version_name`).
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

/// Generate a version id for the given instant.
pub fn version_at(at: DateTime<Utc>) -> String {
    at.format(VERSION_FORMAT).to_string()
}

/// Generate a version id for the current time.
pub fn generate_version() -> String {
    version_at(Utc::now())
}

/// Generate a version that sorts strictly after `latest`.
///
/// Uses the current time unless that would not advance past `latest`, in
/// which case the latest version plus one second is used.
pub fn next_version_after(latest: Option<&str>) -> String {
    let now = generate_version();
    let Some(latest) = latest else {
        return now;
    };
    if now.as_str() > latest {
        return now;
    }

    match NaiveDateTime::parse_from_str(latest, VERSION_FORMAT) {
        Ok(parsed) => (parsed + Duration::seconds(1))
            .format(VERSION_FORMAT)
            .to_string(),
        // Foreign version scheme: suffixing keeps the ordering strict.
        Err(_) => format!("{}_1", latest),
    }
}

/// Check that a version id follows the generated format.
pub fn is_timestamp_version(version: &str) -> bool {
    NaiveDateTime::parse_from_str(version, VERSION_FORMAT).is_ok()
}

/// Which half of a migration is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Apply the migration.
    Up,
    /// Reverse the migration.
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// State of a migration during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Not yet started.
    Pending,
    /// Up SQL is executing.
    Applying,
    /// Up SQL committed.
    Applied,
    /// Up SQL failed and was rolled back.
    Failed,
    /// Down SQL is executing.
    RollingBack,
    /// Down SQL committed.
    RolledBack,
    /// Down SQL failed; needs an operator.
    RollbackFailed,
}

impl MigrationState {
    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Pending, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applied, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }

    /// Check if no further transitions are possible within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack | Self::RollbackFailed)
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}
