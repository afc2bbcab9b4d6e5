//! Strata CLI - versioned schema migrations.

use clap::Parser;
use miette::Diagnostic;

use strata_cli::cli::{Cli, Command};
use strata_cli::commands::{self, Context};
use strata_cli::error::CliResult;
use strata_cli::{logging, output};

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        output::error(&e.to_string());
        if let Some(help) = e.help() {
            eprintln!("  help: {}", help);
        }
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let ctx = Context::load(&cli)?;

    match cli.command {
        Command::Status => commands::status::run(&ctx).await,
        Command::Migrate(args) => commands::migrate::run(&ctx, args).await,
        Command::Rollback(args) => commands::rollback::run(&ctx, args).await,
        Command::Create(args) => commands::create::run(&ctx, args).await,
        Command::CreateFromModels(args) => commands::models::create_from_models(&ctx, args).await,
        Command::ValidateModels(args) => commands::models::validate(&ctx, args).await,
        Command::ShowSql(args) => commands::models::show_sql(&ctx, args).await,
    }
}
