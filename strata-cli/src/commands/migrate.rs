//! `strata migrate` - apply pending migrations.

use crate::cli::MigrateArgs;
use crate::commands::{Context, cancel_on_interrupt, print_report};
use crate::error::CliResult;

/// Run the migrate command
pub async fn run(ctx: &Context, args: MigrateArgs) -> CliResult<()> {
    let manager = ctx.manager().await?;
    cancel_on_interrupt(&manager);

    let report = manager.migrate(args.target.as_deref()).await?;
    print_report(ctx, "Migrate", &report)?;
    report.into_result()?;
    Ok(())
}
