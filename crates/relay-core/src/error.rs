//! Error types for Relay CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors — fatal, reported before anything runs
    #[error("Invalid pipeline definition: {0}")]
    Validation(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Unknown dependency '{needs}' required by job '{job}'")]
    UnknownDependency { job: String, needs: String },

    #[error("Unknown stage '{stage}' referenced by job '{job}'")]
    UnknownStage { job: String, stage: String },

    #[error("Dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    // Variable errors — only raised under the strict policy
    #[error("Unresolved variable '{name}' in job '{job}'")]
    Variable { job: String, name: String },

    // Per-job errors — local to the failing job
    #[error("Job '{job}' failed with exit code {exit_code}")]
    JobFailed { job: String, exit_code: i32 },

    #[error("Job '{job}' timed out after {seconds}s")]
    JobTimeout { job: String, seconds: u64 },

    #[error("Job '{job}' declared artifact '{path}' but did not produce it")]
    MissingArtifact { job: String, path: String },

    // Artifact scope violations — config errors surfaced to the caller
    #[error("Job '{job}' read artifact '{path}' of '{producer}' outside its dependency closure")]
    Scope {
        job: String,
        producer: String,
        path: String,
    },

    #[error("Artifact not found: {job}:{path}")]
    ArtifactNotFound { job: String, path: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Definition-time errors abort the run before any job executes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DuplicateJob(_)
                | Error::UnknownDependency { .. }
                | Error::UnknownStage { .. }
                | Error::Cycle { .. }
        )
    }
}
