//! Styled terminal output utilities.

use owo_colors::OwoColorize;
use serde::Serialize;

use strata_migrate::{MigrationState, RecordStatus};

use crate::error::CliResult;

/// Print a header/title
pub fn header(text: &str) {
    println!();
    println!("{}", text.bold().cyan());
    println!("{}", "─".repeat(text.chars().count()).dimmed());
    println!();
}

/// Print a section header
pub fn section(text: &str) {
    println!("{}", text.bold().white());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a success message
pub fn success(text: &str) {
    println!("{} {}", "✔".green().bold(), text.green());
}

/// Print an info message
pub fn info(text: &str) {
    println!("{} {}", "ℹ".blue().bold(), text);
}

/// Print a warning message
pub fn warn(text: &str) {
    println!("{} {}", "⚠".yellow().bold(), text.yellow());
}

/// Print an error message
pub fn error(text: &str) {
    eprintln!("{} {}", "✖".red().bold(), text.red());
}

/// Print a list item
pub fn list_item(text: &str) {
    println!("  {} {}", "•".dimmed(), text);
}

/// Print a newline
pub fn newline() {
    println!();
}

/// Print dimmed text
pub fn dim(text: &str) {
    println!("{}", text.dimmed());
}

/// Print a block of SQL
pub fn code(code: &str) {
    println!();
    for line in code.lines() {
        println!("  {}", line.bright_white());
    }
    println!();
}

/// Print a value as pretty JSON on stdout
pub fn json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Style a ledger status
pub fn style_status(status: RecordStatus) -> String {
    match status {
        RecordStatus::Applied => status.as_str().green().to_string(),
        RecordStatus::Pending => status.as_str().yellow().to_string(),
        RecordStatus::Failed => status.as_str().red().to_string(),
        RecordStatus::RolledBack => status.as_str().dimmed().to_string(),
    }
}

/// Style a run state
pub fn style_state(state: MigrationState) -> String {
    let text = state.to_string();
    match state {
        MigrationState::Applied | MigrationState::RolledBack => text.green().to_string(),
        MigrationState::Failed | MigrationState::RollbackFailed => text.red().to_string(),
        _ => text.dimmed().to_string(),
    }
}
