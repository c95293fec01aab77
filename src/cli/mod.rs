//! Command-line interface for repo-verifier.
//!
//! Provides the long-running worker plus submission, status, migration and
//! metrics commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
