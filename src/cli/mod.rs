//! Command-line interface for repo-scout.
//!
//! Provides the long-running `run` loop plus one-shot `discover` and `stats`
//! commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
