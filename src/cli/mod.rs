//! Command-line interface for catalog-orchestrator.
//!
//! Provides commands for schema migration, running query job workers,
//! triggering and cancelling pipeline runs, and submitting query jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
