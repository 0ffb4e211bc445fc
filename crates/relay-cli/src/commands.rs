//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline locally
    Run(RunArgs),

    /// Validate a pipeline definition without running it
    Validate {
        /// Path to pipeline file
        pipeline: Option<String>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to pipeline file
    pub pipeline: Option<String>,

    /// Run a single job plus its transitive dependencies
    #[arg(long)]
    pub job: Option<String>,

    /// Run a single stage's jobs plus their transitive dependencies
    #[arg(long)]
    pub stage: Option<String>,

    /// Override a variable (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Maximum number of concurrently running jobs
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Resolve the execution order and print it without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Fail on unresolved variables instead of warning
    #[arg(long)]
    pub strict_vars: bool,

    /// Pass an ambient environment variable through to jobs (repeatable)
    #[arg(long = "pass-env", value_name = "NAME")]
    pub pass_env: Vec<String>,

    /// Root directory for job working directories
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Write the full run report as JSON
    #[arg(long, value_name = "PATH")]
    pub report_json: Option<PathBuf>,

    /// Pre-set the warning flag on dependents of allow_failure jobs
    #[arg(long)]
    pub cascade_warnings: bool,
}
