//! Command-line interface: run the worker, inspect queues, apply migrations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
