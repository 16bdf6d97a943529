//! Command-line interface for relq.
//!
//! Provides the maintenance processes (recovery monitor, delay scheduler)
//! and queue inspection commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
