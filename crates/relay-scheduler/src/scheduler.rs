//! Dependency-driven job scheduling.
//!
//! A single coordinating task owns all run state. Workers execute jobs on
//! a [`JoinSet`] bounded by `max_concurrency`; completions come back over
//! the join set, and readiness is re-evaluated after each one. Dispatch
//! order among simultaneously-ready jobs is `(stage, declaration)` and
//! therefore reproducible; completion order is not, and nothing here
//! assumes it.

use crate::dag::ExecutionGraph;
use chrono::Utc;
use relay_core::ids::{JobId, RunId};
use relay_core::interpolation::{MissingVarPolicy, VariableScope};
use relay_core::model::Pipeline;
use relay_core::pipeline::WhenPolicy;
use relay_core::report::{RunReport, Verdict};
use relay_core::run::{FailureReason, JobRun, JobState, LogLine};
use relay_runner::{InputArtifact, JobContext, JobOutcome, JobRunner};
use relay_store::ArtifactStore;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// A log line tagged with the job it came from, for live output sinks.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub job: String,
    pub line: LogLine,
}

#[derive(Clone)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously running jobs.
    pub max_concurrency: usize,
    /// Root directory; each job gets its own subdirectory.
    pub workspace: PathBuf,
    pub missing_var_policy: MissingVarPolicy,
    /// Pre-set the `warning` flag on dependents of warned jobs.
    pub cascade_warnings: bool,
    /// Environment names passed through into variable resolution.
    pub pass_env: Vec<String>,
    /// Caller-supplied variable overrides (highest precedence).
    pub overrides: HashMap<String, String>,
    /// Explicitly selected job names; `when: manual` runs only if selected.
    pub selected: HashSet<String>,
    /// When set, jobs outside this set are skipped without execution.
    pub include: Option<HashSet<JobId>>,
    /// Live output sink; captured logs land in the report either way.
    pub output_tx: Option<mpsc::Sender<JobOutput>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            workspace: std::env::temp_dir().join("relay"),
            missing_var_policy: MissingVarPolicy::default(),
            cascade_warnings: false,
            pass_env: Vec::new(),
            overrides: HashMap::new(),
            selected: HashSet::new(),
            include: None,
            output_tx: None,
        }
    }
}

/// Whether a newly-unblocked job runs or is settled as skipped.
enum Decision {
    Run,
    Skip,
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        Self { runner, config }
    }

    /// Execute the pipeline to completion and report.
    ///
    /// Never fails: structural errors were caught before this point, and
    /// per-job errors are recorded in the report rather than propagated.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        store: Arc<ArtifactStore>,
    ) -> RunReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let job_count = pipeline.jobs.len();

        info!(run = %run_id, pipeline = %pipeline.name, jobs = job_count, "starting run");

        let mut runs: Vec<JobRun> = pipeline
            .jobs
            .iter()
            .map(|j| JobRun::new(j.id, j.name.clone(), pipeline.stages[j.stage].clone()))
            .collect();
        let mut unmet: Vec<usize> = (0..job_count).map(|i| graph.in_degree(JobId(i))).collect();
        let mut ready: BTreeSet<(usize, JobId)> = BTreeSet::new();
        let mut in_flight: JoinSet<(JobId, relay_core::Result<JobOutcome>, Vec<LogLine>)> =
            JoinSet::new();

        // Seed with zero-dependency jobs, settling immediate skips.
        let seeds: Vec<JobId> = (0..job_count)
            .map(JobId)
            .filter(|j| unmet[j.index()] == 0)
            .collect();
        for job in seeds {
            self.admit(job, pipeline, graph, &mut runs, &mut unmet, &mut ready);
        }

        loop {
            while in_flight.len() < self.config.max_concurrency {
                let Some(&(stage, job)) = ready.iter().next() else {
                    break;
                };
                ready.remove(&(stage, job));
                self.dispatch(
                    job,
                    pipeline,
                    graph,
                    &store,
                    &mut runs,
                    &mut unmet,
                    &mut ready,
                    &mut in_flight,
                )
                .await;
            }

            if in_flight.is_empty() {
                break;
            }

            match in_flight.join_next().await {
                Some(Ok((job, result, log))) => {
                    self.complete(
                        job, result, log, pipeline, graph, &store, &mut runs, &mut unmet,
                        &mut ready,
                    )
                    .await;
                }
                Some(Err(join_err)) => {
                    // The worker never reported back; the final sweep
                    // cancels whatever it left non-terminal.
                    error!(error = %join_err, "worker task failed");
                }
                None => break,
            }
        }

        // Backstop: the report must account for every job.
        for run in runs.iter_mut().filter(|r| !r.state.is_terminal()) {
            run.state = JobState::Canceled;
        }

        let verdict = if runs.iter().any(|r| r.state == JobState::Failed) {
            Verdict::Failed
        } else {
            Verdict::Succeeded
        };

        let completed_at = Utc::now();
        let report = RunReport {
            run_id,
            pipeline: pipeline.name.clone(),
            verdict,
            started_at,
            completed_at,
            duration_ms: start.elapsed().as_millis() as u64,
            jobs: runs,
        };

        info!(
            run = %run_id,
            verdict = ?report.verdict,
            succeeded = report.count(JobState::Succeeded),
            failed = report.count(JobState::Failed),
            skipped = report.count(JobState::Skipped),
            "run finished"
        );
        report
    }

    /// A job's dependencies are all terminal: run it or settle a skip,
    /// cascading through dependents that become unblocked by the skip.
    fn admit(
        &self,
        job: JobId,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        runs: &mut [JobRun],
        unmet: &mut [usize],
        ready: &mut BTreeSet<(usize, JobId)>,
    ) {
        let mut queue = VecDeque::from([job]);
        while let Some(job) = queue.pop_front() {
            match self.decide(job, pipeline, graph, runs) {
                Decision::Run => {
                    runs[job.index()].state = JobState::Ready;
                    if self.config.cascade_warnings {
                        let tainted = graph
                            .dependencies(job)
                            .iter()
                            .any(|d| runs[d.index()].warning);
                        runs[job.index()].warning |= tainted;
                    }
                    ready.insert((pipeline.job(job).stage, job));
                }
                Decision::Skip => {
                    debug!(job = %pipeline.job(job).name, "job skipped");
                    runs[job.index()].state = JobState::Skipped;
                    runs[job.index()].completed_at = Some(Utc::now());
                    for dependent in graph.dependents(job) {
                        unmet[dependent.index()] -= 1;
                        if unmet[dependent.index()] == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }
    }

    /// Evaluate a job's `when` predicate against its dependencies'
    /// terminal states.
    fn decide(
        &self,
        job: JobId,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        runs: &[JobRun],
    ) -> Decision {
        if let Some(include) = &self.config.include
            && !include.contains(&job)
        {
            return Decision::Skip;
        }

        let def = pipeline.job(job);
        let preds = graph.dependencies(job);
        let all_succeeded = preds.iter().all(|d| runs[d.index()].state.is_success());
        let any_failed = preds
            .iter()
            .any(|d| runs[d.index()].state == JobState::Failed);

        match def.when {
            WhenPolicy::Never => Decision::Skip,
            WhenPolicy::Always => Decision::Run,
            WhenPolicy::Manual if !self.config.selected.contains(&def.name) => Decision::Skip,
            WhenPolicy::Manual | WhenPolicy::OnSuccess => {
                if all_succeeded {
                    Decision::Run
                } else {
                    Decision::Skip
                }
            }
            WhenPolicy::OnFailure => {
                if any_failed {
                    Decision::Run
                } else {
                    Decision::Skip
                }
            }
        }
    }

    /// Resolve variables, stage inputs, and hand the job to a worker.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        job: JobId,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        store: &Arc<ArtifactStore>,
        runs: &mut [JobRun],
        unmet: &mut [usize],
        ready: &mut BTreeSet<(usize, JobId)>,
        in_flight: &mut JoinSet<(JobId, relay_core::Result<JobOutcome>, Vec<LogLine>)>,
    ) {
        let def = pipeline.job(job);
        let scope = VariableScope::build(
            &[
                &pipeline.variables,
                &pipeline.stage_variables[def.stage],
                &def.variables,
            ],
            &self.config.overrides,
            &self.config.pass_env,
        );

        let resolved = self.resolve_job_text(def.id, pipeline, &scope);
        let (commands, variables) = match resolved {
            Ok(parts) => parts,
            Err(e) => {
                // Strict variable policy: the job fails without executing.
                runs[job.index()].state = JobState::Failed;
                runs[job.index()].reason = Some(FailureReason::Internal(e.to_string()));
                runs[job.index()].completed_at = Some(Utc::now());
                let now_terminal: Vec<JobId> = graph
                    .dependents(job)
                    .into_iter()
                    .filter(|d| {
                        unmet[d.index()] -= 1;
                        unmet[d.index()] == 0
                    })
                    .collect();
                for dependent in now_terminal {
                    self.admit(dependent, pipeline, graph, runs, unmet, ready);
                }
                return;
            }
        };

        let inputs: Vec<InputArtifact> = store
            .visible_to(job)
            .await
            .into_iter()
            .map(|(_, path, bytes)| InputArtifact { path, bytes })
            .collect();

        let ctx = JobContext {
            job,
            name: def.name.clone(),
            shell: def.shell.clone(),
            commands,
            variables,
            workdir: self.config.workspace.join(sanitize(&def.name)),
            input_artifacts: inputs,
            declared_artifacts: def.artifacts.clone(),
            timeout: Duration::from_secs(def.timeout_seconds),
            retries: def.retries,
        };

        info!(job = %def.name, stage = %pipeline.stages[def.stage], "dispatching job");
        runs[job.index()].state = JobState::Running;
        runs[job.index()].started_at = Some(Utc::now());

        let runner = Arc::clone(&self.runner);
        let sink = self.config.output_tx.clone();
        let job_name = def.name.clone();
        in_flight.spawn(async move {
            let (tx, mut rx) = mpsc::channel::<LogLine>(256);
            let collector = tokio::spawn(async move {
                let mut lines = Vec::new();
                while let Some(line) = rx.recv().await {
                    if let Some(sink) = &sink {
                        let _ = sink
                            .send(JobOutput {
                                job: job_name.clone(),
                                line: line.clone(),
                            })
                            .await;
                    }
                    lines.push(line);
                }
                lines
            });
            let result = runner.execute(&ctx, tx).await;
            let log = collector.await.unwrap_or_default();
            (ctx.job, result, log)
        });
    }

    fn resolve_job_text(
        &self,
        job: JobId,
        pipeline: &Pipeline,
        scope: &VariableScope,
    ) -> relay_core::Result<(Vec<String>, HashMap<String, String>)> {
        let def = pipeline.job(job);
        let policy = self.config.missing_var_policy;

        let commands = def
            .script
            .iter()
            .map(|c| scope.interpolate(&def.name, c, policy))
            .collect::<relay_core::Result<Vec<_>>>()?;

        // Variable values may reference other variables; expand them once.
        let variables = scope
            .clone()
            .into_bindings()
            .into_iter()
            .map(|(k, v)| Ok((k, scope.interpolate(&def.name, &v, policy)?)))
            .collect::<relay_core::Result<HashMap<_, _>>>()?;

        Ok((commands, variables))
    }

    /// Record an executor outcome and release dependents.
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        job: JobId,
        result: relay_core::Result<JobOutcome>,
        log: Vec<LogLine>,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        store: &Arc<ArtifactStore>,
        runs: &mut [JobRun],
        unmet: &mut [usize],
        ready: &mut BTreeSet<(usize, JobId)>,
    ) {
        let def = pipeline.job(job);
        let run = &mut runs[job.index()];
        run.log = log;
        run.completed_at = Some(Utc::now());

        match result {
            Ok(outcome) => {
                run.attempts = outcome.attempts;
                run.exit_code = outcome.exit_code;
                run.duration_ms = Some(outcome.duration_ms);
                if outcome.success {
                    run.state = JobState::Succeeded;
                    for (path, bytes) in outcome.artifacts {
                        store.put(job, path.clone(), bytes).await;
                        run.artifacts.push(path);
                    }
                    info!(job = %def.name, "job succeeded");
                } else if def.allow_failure {
                    run.state = JobState::Succeeded;
                    run.warning = true;
                    run.reason = outcome.reason;
                    info!(job = %def.name, "job failed but allow_failure is set");
                } else {
                    run.state = JobState::Failed;
                    run.reason = outcome.reason;
                    info!(job = %def.name, "job failed");
                }
            }
            Err(e) => {
                run.state = JobState::Failed;
                run.reason = Some(FailureReason::Internal(e.to_string()));
                error!(job = %def.name, error = %e, "job execution error");
            }
        }

        let now_terminal: Vec<JobId> = graph
            .dependents(job)
            .into_iter()
            .filter(|d| {
                unmet[d.index()] -= 1;
                unmet[d.index()] == 0
            })
            .collect();
        for dependent in now_terminal {
            self.admit(dependent, pipeline, graph, runs, unmet, ready);
        }
    }
}

fn sanitize(name: &str) -> String {
    name.replace([' ', '/'], "_")
}
