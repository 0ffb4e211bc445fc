//! Core runner trait and types.

use async_trait::async_trait;
use relay_core::Result;
use relay_core::ids::JobId;
use relay_core::run::{AttemptRecord, FailureReason, LogLine};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// An artifact staged into the job directory before execution.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    /// Path relative to the job directory.
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Everything a runner needs to execute one job.
///
/// Variables and commands arrive fully resolved: interpolation happens in
/// the scheduler, never here.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobId,
    pub name: String,
    pub shell: String,
    /// Commands in order; the first non-zero exit aborts the rest.
    pub commands: Vec<String>,
    pub variables: HashMap<String, String>,
    /// Fresh directory owned by this job for the duration of the run.
    pub workdir: PathBuf,
    pub input_artifacts: Vec<InputArtifact>,
    /// Paths to publish on success, relative to `workdir`.
    pub declared_artifacts: Vec<String>,
    pub timeout: Duration,
    /// Additional attempts after a (non-timeout) failure.
    pub retries: u32,
}

/// Result of executing a job, attempts included.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub attempts: Vec<AttemptRecord>,
    pub duration_ms: u64,
    /// Declared artifacts read back from the job directory.
    pub artifacts: Vec<(String, Vec<u8>)>,
}

/// Trait for job execution.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute a job, streaming output to the provided channel.
    async fn execute(&self, ctx: &JobContext, output_tx: mpsc::Sender<LogLine>)
    -> Result<JobOutcome>;
}

/// Configuration for job execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Delay between retry attempts.
    pub retry_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
        }
    }
}
