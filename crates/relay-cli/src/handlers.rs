//! CLI command handlers.

use crate::commands::RunArgs;
use async_trait::async_trait;
use console::style;
use relay_core::Result;
use relay_core::hooks::{self, NotificationPayload, Notifier};
use relay_core::interpolation::MissingVarPolicy;
use relay_core::model::Pipeline;
use relay_core::pipeline::PipelineDefinition;
use relay_core::report::RunReport;
use relay_core::run::{JobState, LogStream};
use relay_runner::{RunnerConfig, ShellRunner};
use relay_scheduler::{ExecutionGraph, JobOutput, Scheduler, SchedulerConfig};
use relay_store::ArtifactStore;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Exit code for definition and validation errors, per the CLI contract:
/// 0 success, 1 job failure, 2 the pipeline never started.
const EXIT_INVALID: i32 = 2;

/// Find a pipeline file in standard locations.
fn find_pipeline_file(path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = path {
        let path = PathBuf::from(p);
        return path.exists().then_some(path);
    }

    let candidates = [
        ".relay/pipeline.yaml",
        ".relay/pipeline.yml",
        "relay.yaml",
        "relay.yml",
        ".relay.yaml",
        ".relay.yml",
    ];

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Load and parse a pipeline file.
fn load_definition(path: &Path) -> std::result::Result<PipelineDefinition, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_yaml::from_str(&content).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

/// Load, validate, and resolve; shared by `run` and `validate`.
fn prepare(path_arg: Option<&str>) -> std::result::Result<(Pipeline, ExecutionGraph), String> {
    let path = find_pipeline_file(path_arg).ok_or_else(|| "no pipeline file found".to_string())?;
    let definition = load_definition(&path)?;
    let pipeline = Pipeline::load(definition).map_err(|e| e.to_string())?;
    let graph = ExecutionGraph::build(&pipeline).map_err(|e| e.to_string())?;
    Ok((pipeline, graph))
}

pub async fn validate(path_arg: Option<&str>) -> i32 {
    match prepare(path_arg) {
        Ok((pipeline, _)) => {
            println!(
                "{} {} is valid: {} stages, {} jobs",
                style("✓").green().bold(),
                style(&pipeline.name).bold(),
                pipeline.stages.len(),
                pipeline.jobs.len()
            );
            0
        }
        Err(e) => {
            eprintln!("{} {e}", style("✗").red().bold());
            EXIT_INVALID
        }
    }
}

pub async fn run(args: RunArgs) -> i32 {
    let (pipeline, graph) = match prepare(args.pipeline.as_deref()) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("{} {e}", style("✗").red().bold());
            return EXIT_INVALID;
        }
    };

    if args.dry_run {
        print_execution_order(&pipeline, &graph);
        return 0;
    }

    let overrides = match parse_vars(&args.vars) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("{} {e}", style("✗").red().bold());
            return EXIT_INVALID;
        }
    };

    let (include, selected) = match build_selection(&pipeline, &graph, &args) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("{} {e}", style("✗").red().bold());
            return EXIT_INVALID;
        }
    };

    // Job directories live under the given workspace, or a temp root
    // cleaned up when the run ends.
    let mut _workspace_guard: Option<tempfile::TempDir> = None;
    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => match tempfile::tempdir() {
            Ok(dir) => {
                let path = dir.path().to_path_buf();
                _workspace_guard = Some(dir);
                path
            }
            Err(e) => {
                eprintln!("{} cannot create workspace: {e}", style("✗").red().bold());
                return EXIT_INVALID;
            }
        },
    };

    println!(
        "\n{} Running pipeline: {}",
        style("▶").cyan().bold(),
        style(&pipeline.name).bold()
    );
    println!(
        "  {} stages, {} jobs, concurrency {}\n",
        pipeline.stages.len(),
        pipeline.jobs.len(),
        args.concurrency
            .unwrap_or_else(|| SchedulerConfig::default().max_concurrency)
    );

    let (output_tx, mut output_rx) = mpsc::channel::<JobOutput>(256);
    let printer = tokio::spawn(async move {
        while let Some(out) = output_rx.recv().await {
            let prefix = style(format!("{} |", out.job)).dim();
            match out.line.stream {
                LogStream::Stdout => println!("  {prefix} {}", out.line.content),
                LogStream::Stderr => {
                    println!("  {prefix} {}", style(&out.line.content).red().dim())
                }
            }
        }
    });

    let config = SchedulerConfig {
        max_concurrency: args
            .concurrency
            .unwrap_or_else(|| SchedulerConfig::default().max_concurrency)
            .max(1),
        workspace,
        missing_var_policy: if args.strict_vars {
            MissingVarPolicy::Fail
        } else {
            MissingVarPolicy::Warn
        },
        cascade_warnings: args.cascade_warnings,
        pass_env: args.pass_env.clone(),
        overrides,
        selected,
        include,
        output_tx: Some(output_tx),
    };

    let store = Arc::new(ArtifactStore::new(
        graph.closures(),
        pipeline.jobs.iter().map(|j| j.name.clone()).collect(),
    ));
    let runner = Arc::new(ShellRunner::new(RunnerConfig::default()));
    let scheduler = Scheduler::new(runner, config);

    let report = scheduler.run(&pipeline, &graph, Arc::clone(&store)).await;

    // Close the live output stream before printing the summary.
    drop(scheduler);
    let _ = printer.await;

    hooks::fire_hooks(&pipeline, &report, &ConsoleNotifier).await;
    print_summary(&report);

    if let Some(path) = &args.report_json
        && let Err(e) = write_report_json(&report, path)
    {
        eprintln!("{} cannot write report: {e}", style("⚠").yellow());
    }

    report.exit_code()
}

fn parse_vars(vars: &[String]) -> std::result::Result<HashMap<String, String>, String> {
    vars.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("invalid --var '{pair}', expected KEY=VALUE"))
        })
        .collect()
}

/// Turn `--job` / `--stage` into an include set plus the explicitly
/// selected names (which unlock `when: manual`).
fn build_selection(
    pipeline: &Pipeline,
    graph: &ExecutionGraph,
    args: &RunArgs,
) -> std::result::Result<
    (
        Option<HashSet<relay_core::ids::JobId>>,
        HashSet<String>,
    ),
    String,
> {
    let mut selected = HashSet::new();
    let mut roots = Vec::new();

    if let Some(job) = &args.job {
        let def = pipeline
            .job_by_name(job)
            .ok_or_else(|| format!("unknown job '{job}'"))?;
        roots.push(def.id);
        selected.insert(def.name.clone());
    }

    if let Some(stage) = &args.stage {
        let stage_idx = pipeline
            .stages
            .iter()
            .position(|s| s == stage)
            .ok_or_else(|| format!("unknown stage '{stage}'"))?;
        roots.extend(
            pipeline
                .jobs
                .iter()
                .filter(|j| j.stage == stage_idx)
                .map(|j| j.id),
        );
    }

    if roots.is_empty() {
        return Ok((None, selected));
    }
    Ok((Some(graph.selection_closure(&roots)), selected))
}

fn print_execution_order(pipeline: &Pipeline, graph: &ExecutionGraph) {
    println!(
        "\n{} Execution order for {}:",
        style("▶").cyan().bold(),
        style(&pipeline.name).bold()
    );
    for (pos, job) in graph.topological_hint().iter().enumerate() {
        let def = pipeline.job(*job);
        let needs: Vec<&str> = graph
            .dependencies(*job)
            .iter()
            .map(|d| pipeline.job(*d).name.as_str())
            .collect();
        let suffix = if needs.is_empty() {
            String::new()
        } else {
            format!("  (needs {})", needs.join(", "))
        };
        println!(
            "  {:>3}. {}/{}{}",
            pos + 1,
            style(&pipeline.stages[def.stage]).dim(),
            def.name,
            style(suffix).dim()
        );
    }
}

fn print_summary(report: &RunReport) {
    println!();
    for job in &report.jobs {
        let (symbol, state) = match job.state {
            JobState::Succeeded if job.warning => {
                (style("!").yellow().bold(), "succeeded (warning)")
            }
            JobState::Succeeded => (style("✓").green().bold(), "succeeded"),
            JobState::Failed => (style("✗").red().bold(), "failed"),
            JobState::Skipped => (style("-").dim(), "skipped"),
            JobState::Canceled => (style("-").yellow(), "canceled"),
            _ => (style("?").dim(), "unknown"),
        };
        let duration = job
            .duration_ms
            .map(|ms| format!(" ({:.2}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        let attempts = if job.attempts.len() > 1 {
            format!(", {} attempts", job.attempts.len())
        } else {
            String::new()
        };
        let reason = job
            .error()
            .map(|e| format!(": {e}"))
            .unwrap_or_default();
        println!(
            "  {symbol} {:24} {state}{}{}{}",
            format!("{}/{}", job.stage, job.name),
            style(reason).red(),
            style(duration).dim(),
            style(attempts).dim()
        );
    }

    println!();
    let totals = format!(
        "{} succeeded, {} failed, {} skipped",
        report.count(JobState::Succeeded),
        report.count(JobState::Failed),
        report.count(JobState::Skipped),
    );
    if report.succeeded() {
        println!(
            "{} Pipeline completed in {:.2}s ({totals})",
            style("✓").green().bold(),
            report.duration_ms as f64 / 1000.0
        );
    } else {
        println!(
            "{} Pipeline failed after {:.2}s ({totals})",
            style("✗").red().bold(),
            report.duration_ms as f64 / 1000.0
        );
    }
}

fn write_report_json(report: &RunReport, path: &Path) -> std::result::Result<(), String> {
    let file = std::fs::File::create(path).map_err(|e| e.to_string())?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)
        .map_err(|e| e.to_string())
}

/// Prints hook notifications to the console. Network transports are the
/// caller's business; the reference driver only needs visibility.
struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        println!("{} {}", style("✉").cyan(), payload.message);
        Ok(())
    }
}
