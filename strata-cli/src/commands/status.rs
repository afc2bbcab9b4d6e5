//! `strata status` - applied, pending and drifted migrations.

use crate::commands::Context;
use crate::error::CliResult;
use crate::output;

/// Run the status command
pub async fn run(ctx: &Context) -> CliResult<()> {
    let manager = ctx.manager().await?;
    let report = manager.status().await?;

    if ctx.json {
        return output::json(&report);
    }

    output::header("Migration Status");
    if report.migrations.is_empty() {
        output::info("No migrations found");
        return Ok(());
    }

    for migration in &report.migrations {
        let mut line = format!(
            "{} {} [{}]",
            migration.version,
            migration.name,
            output::style_status(migration.status)
        );
        if migration.checksum_matches == Some(false) {
            line.push_str(" (modified after apply)");
        }
        if !migration.has_source {
            line.push_str(" (definition missing)");
        }
        output::list_item(&line);
        if let Some(error) = &migration.error_message {
            output::dim(&format!("      {}", error));
        }
    }

    output::newline();
    output::kv("Applied", &report.applied_count().to_string());
    output::kv("Pending", &report.pending_count().to_string());

    let drifted = report.drifted();
    if !drifted.is_empty() {
        output::newline();
        output::warn(&format!(
            "{} applied migration(s) changed on disk; the next migrate will refuse to run",
            drifted.len()
        ));
    }
    Ok(())
}
