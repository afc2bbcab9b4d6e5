//! CLI argument definitions using clap.

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Strata CLI - versioned schema migrations
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Strata CLI - versioned schema migrations", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "strata.toml")]
    pub config: PathBuf,

    /// Database URL, overriding the configuration file
    #[arg(long, global = true, env = "STRATA_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show applied, pending and drifted migrations
    Status,

    /// Apply pending migrations
    Migrate(MigrateArgs),

    /// Roll back applied migrations
    Rollback(RollbackArgs),

    /// Create an empty or hand-written migration
    Create(CreateArgs),

    /// Generate a migration by diffing models against the last snapshot
    CreateFromModels(CreateFromModelsArgs),

    /// Check model definitions for errors
    ValidateModels(ModelsArgs),

    /// Print the SQL a model change would generate
    ShowSql(ModelsArgs),
}

// =============================================================================
// Migrate Command
// =============================================================================

/// Arguments for the `migrate` command
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Stop after this version
    #[arg(short, long)]
    pub target: Option<String>,
}

// =============================================================================
// Rollback Command
// =============================================================================

/// Arguments for the `rollback` command
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("scope").required(true).args(["target", "steps"])))]
pub struct RollbackArgs {
    /// Roll back every migration newer than this version
    pub target: Option<String>,

    /// Roll back this many of the most recent migrations
    #[arg(short, long)]
    pub steps: Option<usize>,
}

// =============================================================================
// Create Commands
// =============================================================================

/// Arguments for the `create` command
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Name for the migration
    pub name: String,

    /// Up SQL
    #[arg(long, conflicts_with = "up_file")]
    pub up: Option<String>,

    /// File containing the up SQL
    #[arg(long)]
    pub up_file: Option<PathBuf>,

    /// Down SQL
    #[arg(long, conflicts_with = "down_file")]
    pub down: Option<String>,

    /// File containing the down SQL
    #[arg(long)]
    pub down_file: Option<PathBuf>,
}

/// Arguments for the `create-from-models` command
#[derive(Args, Debug)]
pub struct CreateFromModelsArgs {
    /// Name for the migration
    pub name: String,

    #[command(flatten)]
    pub models: ModelsArgs,
}

/// Model and snapshot locations
#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Path to the models file
    #[arg(short, long)]
    pub models: Option<PathBuf>,

    /// Path to the schema snapshot
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}
