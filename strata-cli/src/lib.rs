//! Strata CLI - command-line interface for the Strata migration engine.
//!
//! Each subcommand relays to one `MigrationManager` operation and prints its
//! result, either styled for a terminal or as JSON with `--json`.

pub mod cli;
pub mod commands;
pub mod config;
pub mod connect;
pub mod error;
pub mod logging;
pub mod output;
