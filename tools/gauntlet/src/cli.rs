//! Command-line interface definitions for gauntlet.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

/// Build a project and run the test executables it produces.
#[derive(Parser)]
#[command(name = "gauntlet", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Force re-running link and install steps, bypassing cache checks.
    #[arg(long, short = 'f', global = true)]
    pub force: bool,

    /// Only print test failures, errors and the final summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with timing and cache diagnostics.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Maximum number of parallel workers (0 or omitted = auto-detect from CPU count).
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,

    /// Path to gauntlet.toml (default: search upward from the current directory).
    #[arg(long, global = true)]
    pub manifest_path: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run link and install steps, then every test.
    Build(BuildArgs),
    /// Print the resolved configuration and build graph.
    Configure,
    /// Remove the build directory.
    Clean,
}

/// Arguments for the `build` subcommand.
#[derive(Parser, Default)]
pub struct BuildArgs {
    /// Build without running any test.
    #[arg(long)]
    pub notests: bool,

    /// Record test failures without failing the build.
    #[arg(long)]
    pub permissive_tests: bool,

    /// Run every test through a wrapper, e.g. "valgrind --error-exitcode=1 %s".
    #[arg(long, value_name = "TEMPLATE")]
    pub testcmd: Option<String>,
}

impl Cli {
    /// Configuration overrides carried by the flags.
    pub fn overrides(&self) -> Overrides {
        let build = match self.command {
            Command::Build(ref args) => Some(args),
            Command::Configure | Command::Clean => None,
        };
        Overrides {
            no_tests: build.is_some_and(|b| b.notests),
            permissive: build.is_some_and(|b| b.permissive_tests),
            testcmd: build.and_then(|b| b.testcmd.clone()),
            jobs: self.jobs,
            force: self.force,
        }
    }
}
