//! `strata rollback` - revert applied migrations.

use crate::cli::RollbackArgs;
use crate::commands::{Context, cancel_on_interrupt, print_report};
use crate::error::{CliError, CliResult};

/// Run the rollback command
pub async fn run(ctx: &Context, args: RollbackArgs) -> CliResult<()> {
    let manager = ctx.manager().await?;
    cancel_on_interrupt(&manager);

    let report = match (args.target, args.steps) {
        (_, Some(steps)) => manager.rollback_steps(steps).await?,
        (Some(target), None) => manager.rollback(&target).await?,
        (None, None) => {
            return Err(CliError::Command(
                "pass a target version or --steps".to_string(),
            ));
        }
    };

    print_report(ctx, "Rollback", &report)?;
    report.into_result()?;
    Ok(())
}
