//! Pipeline run report.

use crate::ids::RunId;
use crate::run::{JobRun, JobState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

/// Aggregated result of a pipeline run.
///
/// Built by the scheduler once the run terminates; read-only afterwards.
/// Producing the report never fails, so the caller always gets a full
/// accounting of what ran, what failed, and what was skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One entry per job, in declaration order.
    pub jobs: Vec<JobRun>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn warnings(&self) -> usize {
        self.jobs.iter().filter(|j| j.warning).count()
    }

    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Exit code for a reference driver: 0 on success, 1 on failure.
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            Verdict::Succeeded => 0,
            Verdict::Failed => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;

    #[test]
    fn counts_and_exit_code() {
        let mut ok = JobRun::new(JobId(0), "a", "build");
        ok.state = JobState::Succeeded;
        let mut warned = JobRun::new(JobId(1), "b", "test");
        warned.state = JobState::Succeeded;
        warned.warning = true;
        let mut skipped = JobRun::new(JobId(2), "c", "deploy");
        skipped.state = JobState::Skipped;

        let now = Utc::now();
        let report = RunReport {
            run_id: RunId::new(),
            pipeline: "p".to_string(),
            verdict: Verdict::Succeeded,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            jobs: vec![ok, warned, skipped],
        };

        assert_eq!(report.count(JobState::Succeeded), 2);
        assert_eq!(report.count(JobState::Skipped), 1);
        assert_eq!(report.count(JobState::Failed), 0);
        assert_eq!(report.warnings(), 1);
        assert_eq!(report.exit_code(), 0);
        assert!(report.job("c").is_some());
    }
}
