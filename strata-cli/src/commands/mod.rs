//! CLI command implementations.

pub mod create;
pub mod migrate;
pub mod models;
pub mod rollback;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_migrate::{Compensation, MigrationManager, RunReport};
use tracing::debug;

use crate::cli::Cli;
use crate::config::Config;
use crate::connect::{self, OfflineAdapter};
use crate::error::{CliError, CliResult};
use crate::output;

/// Settings shared by every command.
#[derive(Debug)]
pub struct Context {
    /// Loaded configuration.
    pub config: Config,
    /// Directory relative paths in the configuration resolve against.
    pub base_dir: PathBuf,
    /// URL from the command line or environment.
    pub database_url: Option<String>,
    /// Print JSON instead of styled text.
    pub json: bool,
}

impl Context {
    /// Load the configuration named on the command line.
    pub fn load(cli: &Cli) -> CliResult<Self> {
        let base_dir = cli
            .config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config: Config::load_or_default(&cli.config)?,
            base_dir,
            database_url: cli.database_url.clone(),
            json: cli.json,
        })
    }

    /// Manager connected to the configured database.
    pub async fn manager(&self) -> CliResult<MigrationManager> {
        let dialect = self.config.dialect()?;
        let url = self
            .database_url
            .clone()
            .or_else(|| self.config.database.url.clone())
            .ok_or_else(|| {
                CliError::Config(
                    "no database URL; set database.url in strata.toml or STRATA_DATABASE_URL"
                        .to_string(),
                )
            })?;

        debug!(dialect = %dialect, "Connecting to database");
        let adapter = connect::open(dialect, &url, &self.base_dir).await?;
        Ok(MigrationManager::from_config(
            adapter,
            self.config.migrator_config(&self.base_dir),
        ))
    }

    /// Manager for commands that only read and write migration files.
    pub fn offline_manager(&self) -> CliResult<MigrationManager> {
        let adapter = Arc::new(OfflineAdapter::new(self.config.dialect()?));
        Ok(MigrationManager::from_config(
            adapter,
            self.config.migrator_config(&self.base_dir),
        ))
    }

    /// Models file, from the command line or the configuration.
    pub fn models_path(&self, path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) => path.to_path_buf(),
            None => self.base_dir.join(&self.config.models.path),
        }
    }

    /// Snapshot file, from the command line or the configuration.
    pub fn snapshot_path(&self, path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) => path.to_path_buf(),
            None => self.base_dir.join(&self.config.models.snapshot),
        }
    }
}

/// Stop the run at the next migration boundary on Ctrl-C.
pub(crate) fn cancel_on_interrupt(manager: &MigrationManager) {
    let token = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warn("Interrupted; stopping after the current migration");
            token.cancel();
        }
    });
}

/// Print a migrate or rollback report.
pub(crate) fn print_report(ctx: &Context, title: &str, report: &RunReport) -> CliResult<()> {
    if ctx.json {
        return output::json(report);
    }

    output::header(title);
    for outcome in &report.outcomes {
        let mut line = format!(
            "{} {} [{}]",
            outcome.version,
            outcome.name,
            output::style_state(outcome.state)
        );
        if outcome.reverted {
            line.push_str(" (reverted)");
        }
        if outcome.succeeded() {
            line.push_str(&format!(" {}ms", outcome.duration_ms));
        }
        output::list_item(&line);

        if let Some(error) = &outcome.error {
            output::error(&format!("    {}", error));
        }
        match &outcome.compensation {
            Some(Compensation::Applied) => output::dim("    partial changes undone with down SQL"),
            Some(Compensation::Failed(error)) => {
                output::warn(&format!("    cleanup failed, fix manually: {}", error))
            }
            Some(Compensation::Unavailable) => {
                output::warn("    no down SQL; partial changes remain")
            }
            None => {}
        }
    }

    if !report.outcomes.is_empty() {
        output::newline();
    }
    if report.is_success() {
        output::success(&report.summary());
    } else {
        output::warn(&report.summary());
    }
    Ok(())
}
