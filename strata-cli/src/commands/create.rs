//! `strata create` - write a hand-authored migration.

use std::path::PathBuf;

use crate::cli::CreateArgs;
use crate::commands::Context;
use crate::error::CliResult;
use crate::output;

const UP_TEMPLATE: &str = "-- Write the migration SQL here\n";

/// Run the create command
pub async fn run(ctx: &Context, args: CreateArgs) -> CliResult<()> {
    let up = read_sql(args.up, args.up_file)
        .await?
        .unwrap_or_else(|| UP_TEMPLATE.to_string());
    let down = read_sql(args.down, args.down_file).await?;

    let manager = ctx.offline_manager()?;
    let migration = manager.create_migration(&args.name, up, down).await?;

    if ctx.json {
        return output::json(&migration);
    }

    let path = manager
        .config()
        .migrations_dir
        .join(migration.full_name());
    output::success(&format!("Created migration {}", migration.full_name()));
    output::kv("Path", &path.display().to_string());
    if !migration.is_reversible() {
        output::warn("No down SQL given; this migration cannot be rolled back");
    }
    Ok(())
}

async fn read_sql(inline: Option<String>, file: Option<PathBuf>) -> CliResult<Option<String>> {
    match (inline, file) {
        (Some(sql), _) => Ok(Some(sql)),
        (None, Some(path)) => Ok(Some(tokio::fs::read_to_string(path).await?)),
        (None, None) => Ok(None),
    }
}
