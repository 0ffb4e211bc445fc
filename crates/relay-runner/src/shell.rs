//! Shell-based job execution on the host.

use crate::runner::{JobContext, JobOutcome, JobRunner, RunnerConfig};
use async_trait::async_trait;
use relay_core::run::{AttemptRecord, FailureReason, LogLine, LogStream};
use relay_core::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runs a job's command sequence in its own working directory on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

struct AttemptOutcome {
    exit_code: i32,
    timed_out: bool,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Create the job directory and materialize input artifacts into it.
    async fn stage_inputs(&self, ctx: &JobContext) -> Result<()> {
        tokio::fs::create_dir_all(&ctx.workdir).await?;
        for artifact in &ctx.input_artifacts {
            let dest = ctx.workdir.join(&artifact.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &artifact.bytes).await?;
        }
        Ok(())
    }

    /// Run every command of one attempt, stopping at the first failure.
    async fn run_attempt(
        &self,
        ctx: &JobContext,
        line_counter: &Arc<AtomicU32>,
        output_tx: &mpsc::Sender<LogLine>,
    ) -> Result<AttemptOutcome> {
        let deadline = Instant::now() + ctx.timeout;

        for command in &ctx.commands {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(AttemptOutcome {
                    exit_code: -1,
                    timed_out: true,
                });
            }

            info!(job = %ctx.name, command = %command, "executing command");

            let mut env_vars: HashMap<String, String> = std::env::vars().collect();
            env_vars.extend(ctx.variables.clone());

            let mut child = Command::new(&ctx.shell)
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.workdir)
                .envs(&env_vars)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| Error::Internal(format!("failed to spawn process: {e}")))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Internal("missing stdout pipe".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| Error::Internal("missing stderr pipe".into()))?;

            let stdout_handle = spawn_line_reader(
                stdout,
                LogStream::Stdout,
                Arc::clone(line_counter),
                output_tx.clone(),
            );
            let stderr_handle = spawn_line_reader(
                stderr,
                LogStream::Stderr,
                Arc::clone(line_counter),
                output_tx.clone(),
            );

            let wait_result = match timeout(remaining, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job = %ctx.name, timeout_secs = ctx.timeout.as_secs(), "job timed out, killing process");
                    let _ = child.kill().await;
                    let _ = stdout_handle.await;
                    let _ = stderr_handle.await;
                    return Ok(AttemptOutcome {
                        exit_code: -1,
                        timed_out: true,
                    });
                }
            };

            let _ = stdout_handle.await;
            let _ = stderr_handle.await;

            let status = wait_result
                .map_err(|e| Error::Internal(format!("failed to wait for process: {e}")))?;
            let exit_code = status.code().unwrap_or(-1);

            debug!(job = %ctx.name, exit_code, "command completed");

            if exit_code != 0 {
                return Ok(AttemptOutcome {
                    exit_code,
                    timed_out: false,
                });
            }
        }

        Ok(AttemptOutcome {
            exit_code: 0,
            timed_out: false,
        })
    }

    /// Read declared artifacts back out of the job directory.
    async fn collect_artifacts(&self, ctx: &JobContext) -> Result<Vec<(String, Vec<u8>)>> {
        let mut collected = Vec::with_capacity(ctx.declared_artifacts.len());
        for path in &ctx.declared_artifacts {
            let bytes = tokio::fs::read(ctx.workdir.join(path)).await.map_err(|_| {
                Error::MissingArtifact {
                    job: ctx.name.clone(),
                    path: path.clone(),
                }
            })?;
            collected.push((path.clone(), bytes));
        }
        Ok(collected)
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: LogStream,
    counter: Arc<AtomicU32>,
    tx: mpsc::Sender<LogLine>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(content)) = lines.next_line().await {
            let line = LogLine {
                stream,
                line_number: counter.fetch_add(1, Ordering::Relaxed) + 1,
                content,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &JobContext,
        output_tx: mpsc::Sender<LogLine>,
    ) -> Result<JobOutcome> {
        let start = Instant::now();
        self.stage_inputs(ctx).await?;

        let line_counter = Arc::new(AtomicU32::new(0));
        let mut attempts = Vec::new();
        let max_attempts = ctx.retries + 1;

        for number in 1..=max_attempts {
            if number > 1 {
                info!(job = %ctx.name, attempt = number, max_attempts, "retrying job");
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let started_at = chrono::Utc::now();
            let attempt_start = Instant::now();
            let outcome = self.run_attempt(ctx, &line_counter, &output_tx).await?;

            attempts.push(AttemptRecord {
                number,
                exit_code: Some(outcome.exit_code),
                timed_out: outcome.timed_out,
                started_at,
                duration_ms: attempt_start.elapsed().as_millis() as u64,
            });

            if outcome.timed_out {
                // Timeouts are never retried.
                return Ok(JobOutcome {
                    success: false,
                    exit_code: None,
                    reason: Some(FailureReason::Timeout),
                    attempts,
                    duration_ms: start.elapsed().as_millis() as u64,
                    artifacts: Vec::new(),
                });
            }

            if outcome.exit_code == 0 {
                return match self.collect_artifacts(ctx).await {
                    Ok(artifacts) => Ok(JobOutcome {
                        success: true,
                        exit_code: Some(0),
                        reason: None,
                        attempts,
                        duration_ms: start.elapsed().as_millis() as u64,
                        artifacts,
                    }),
                    Err(Error::MissingArtifact { path, .. }) => Ok(JobOutcome {
                        success: false,
                        exit_code: Some(0),
                        reason: Some(FailureReason::MissingArtifact(path)),
                        attempts,
                        duration_ms: start.elapsed().as_millis() as u64,
                        artifacts: Vec::new(),
                    }),
                    Err(e) => Err(e),
                };
            }

            if number < max_attempts {
                warn!(job = %ctx.name, exit_code = outcome.exit_code, "job failed, will retry");
            }
        }

        let last_exit = attempts.last().and_then(|a| a.exit_code).unwrap_or(-1);
        Ok(JobOutcome {
            success: false,
            exit_code: Some(last_exit),
            reason: Some(FailureReason::ExitCode(last_exit)),
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
            artifacts: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::InputArtifact;
    use relay_core::ids::JobId;
    use std::time::Duration;

    fn make_ctx(dir: &std::path::Path, commands: &[&str]) -> JobContext {
        JobContext {
            job: JobId(0),
            name: "test".to_string(),
            shell: "sh".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            variables: HashMap::new(),
            workdir: dir.to_path_buf(),
            input_artifacts: vec![],
            declared_artifacts: vec![],
            timeout: Duration::from_secs(30),
            retries: 0,
        }
    }

    #[tokio::test]
    async fn runs_commands_and_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, mut rx) = mpsc::channel(16);

        let ctx = make_ctx(dir.path(), &["echo hello"]);
        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.attempts.len(), 1);

        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "hello");
        assert_eq!(line.stream, LogStream::Stdout);
        assert_eq!(line.line_number, 1);
    }

    #[tokio::test]
    async fn nonzero_exit_aborts_remaining_commands() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(16);

        let ctx = make_ctx(dir.path(), &["exit 3", "touch never.txt"]);
        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(
            outcome.reason,
            Some(FailureReason::ExitCode(3))
        );
        assert!(!dir.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn resolved_variables_reach_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, mut rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["echo $GREETING"]);
        ctx.variables
            .insert("GREETING".to_string(), "bonjour".to_string());

        let outcome = runner.execute(&ctx, tx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(rx.recv().await.unwrap().content, "bonjour");
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            retry_delay: Duration::from_millis(1),
        });
        let (tx, _rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["sleep 10"]);
        ctx.timeout = Duration::from_millis(200);
        ctx.retries = 2;

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(FailureReason::Timeout));
        // Retries are for failures, never timeouts.
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].timed_out);
    }

    #[tokio::test]
    async fn retries_rerun_from_the_first_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            retry_delay: Duration::from_millis(1),
        });
        let (tx, _rx) = mpsc::channel(64);

        // First attempt leaves a marker and fails; the retry sees it and
        // succeeds, proving the sequence restarted from the top.
        let mut ctx = make_ctx(
            dir.path(),
            &["test -f marker && exit 0 || (touch marker; exit 1)"],
        );
        ctx.retries = 1;

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].exit_code, Some(1));
        assert_eq!(outcome.attempts[1].exit_code, Some(0));
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_last_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            retry_delay: Duration::from_millis(1),
        });
        let (tx, _rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["exit 7"]);
        ctx.retries = 2;

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.exit_code, Some(7));
        assert_eq!(outcome.reason, Some(FailureReason::ExitCode(7)));
    }

    #[tokio::test]
    async fn collects_declared_artifacts_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["mkdir -p out", "printf payload > out/bin"]);
        ctx.declared_artifacts = vec!["out/bin".to_string()];

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].0, "out/bin");
        assert_eq!(outcome.artifacts[0].1, b"payload");
    }

    #[tokio::test]
    async fn missing_declared_artifact_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["true"]);
        ctx.declared_artifacts = vec!["ghost.tar".to_string()];

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.reason,
            Some(FailureReason::MissingArtifact("ghost.tar".to_string()))
        );
    }

    #[tokio::test]
    async fn input_artifacts_are_staged_before_commands_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let (tx, mut rx) = mpsc::channel(16);

        let mut ctx = make_ctx(dir.path(), &["cat deps/lib.txt"]);
        ctx.input_artifacts = vec![InputArtifact {
            path: "deps/lib.txt".to_string(),
            bytes: b"from upstream".to_vec(),
        }];

        let outcome = runner.execute(&ctx, tx).await.unwrap();

        assert!(outcome.success);
        assert_eq!(rx.recv().await.unwrap().content, "from upstream");
    }
}
