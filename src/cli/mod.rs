//! Command-line interface for jobforge.
//!
//! Provides commands to run workers, allocators and the scheduler, and to
//! enqueue jobs and manage pools.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
