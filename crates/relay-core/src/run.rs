//! Run and execution types.

use crate::error::Error;
use crate::ids::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State machine for one job within a pipeline run.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed}`, with `Skipped`
/// and `Canceled` as terminal shortcuts that bypass execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Canceled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ExitCode(i32),
    Timeout,
    MissingArtifact(String),
    Internal(String),
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub number: u32,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A captured output line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Mutable runtime record for one job, one per job per run.
///
/// Owned by the scheduler; written from executor outcomes on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job: JobId,
    pub name: String,
    pub stage: String,
    pub state: JobState,
    /// Set when an `allow_failure` job actually failed, or when a warning
    /// cascaded from a dependency under the cascade policy.
    pub warning: bool,
    pub exit_code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub attempts: Vec<AttemptRecord>,
    pub log: Vec<LogLine>,
    /// Artifact paths published to the store.
    pub artifacts: Vec<String>,
}

impl JobRun {
    /// View a failed job as a typed error, for callers that want a
    /// per-job `Result` rather than the report's state field.
    pub fn error(&self) -> Option<Error> {
        if self.state != JobState::Failed {
            return None;
        }
        Some(match &self.reason {
            Some(FailureReason::Timeout) => Error::JobTimeout {
                job: self.name.clone(),
                seconds: self.duration_ms.unwrap_or(0) / 1000,
            },
            Some(FailureReason::ExitCode(code)) => Error::JobFailed {
                job: self.name.clone(),
                exit_code: *code,
            },
            Some(FailureReason::MissingArtifact(path)) => Error::MissingArtifact {
                job: self.name.clone(),
                path: path.clone(),
            },
            Some(FailureReason::Internal(msg)) => Error::Internal(msg.clone()),
            None => Error::JobFailed {
                job: self.name.clone(),
                exit_code: self.exit_code.unwrap_or(-1),
            },
        })
    }

    pub fn new(job: JobId, name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            job,
            name: name.into(),
            stage: stage.into(),
            state: JobState::Pending,
            warning: false,
            exit_code: None,
            reason: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: Vec::new(),
            log: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_jobs_surface_typed_errors() {
        let mut run = JobRun::new(JobId(0), "unit", "test");
        assert!(run.error().is_none());

        run.state = JobState::Failed;
        run.reason = Some(FailureReason::ExitCode(2));
        assert!(matches!(
            run.error(),
            Some(Error::JobFailed { job, exit_code: 2 }) if job == "unit"
        ));

        run.reason = Some(FailureReason::Timeout);
        run.duration_ms = Some(61_000);
        assert!(matches!(
            run.error(),
            Some(Error::JobTimeout { seconds: 61, .. })
        ));
    }
}
