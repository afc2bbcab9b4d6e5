//! Log output for the CLI.
//!
//! - `STRATA_LOG` - filter directives, e.g. `info` or `strata_migrate=debug` (default: `warn`)
//! - `STRATA_LOG_FORMAT` - `pretty`, `compact` or `json` (default: `compact`)
//!
//! Logs go to stderr so `--json` output on stdout stays machine readable.

use std::env;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Get the configured log format from `STRATA_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("STRATA_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "json" => "json",
            _ => "compact",
        })
        .unwrap_or("compact")
}

/// Initialize the subscriber. Call once at startup.
pub fn init() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

    let result = match get_log_format() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };

    // A subscriber installed by an embedding program wins.
    let _ = result;
}
