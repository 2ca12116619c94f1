use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kiln::config::{PipelineConfig, DEFAULT_CONFIG_FILE};
use kiln::core::{RunRequest, TaskOutcome};
use kiln::orchestration::{cancel_on_ctrl_c, spawn_status_printer, DevSession, RunResult};
use kiln::pipeline::clean_output;
use kiln::util::format_duration;
use kiln::{klog, klog_error, Error, Pipeline, Result};

/// Kiln - static-site asset pipeline with watch mode and live reload
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KILN_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Configuration file (default: kiln.toml in the project directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Enable debug logging (writes to <project>/.kiln/kiln.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Maximum number of tasks running at once
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Clean, then build everything including minified variants
    Build {
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clean, build, then watch and serve with live reload (default)
    Dev {
        /// Port for the dev server
        #[arg(long)]
        port: Option<u16>,
    },

    /// Remove the output directory
    Clean,

    /// Convert fonts and regenerate the font stylesheet fragment
    Fonts,

    /// Run named tasks
    Run {
        /// Tasks to run
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Skip predecessors of the named tasks
        #[arg(long)]
        only: bool,

        /// Include release-only tasks in the selection
        #[arg(long)]
        release: bool,
    },

    /// List tasks in execution order
    Tasks,
}

const EXIT_TASK_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let project = match project_root(cli.project.as_deref()) {
        Ok(project) => project,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    if let Some(path) = kiln::log::init(&project, cli.debug) {
        if kiln::log::enabled(kiln::log::LogLevel::Debug) {
            eprintln!("Logging to {}", path.display());
        }
    }
    klog!("Kiln starting: project={} command={:?}", project.display(), cli.command);

    match run(&cli, &project) {
        Ok(code) => code,
        Err(e) => {
            klog_error!("Fatal: {}", e);
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn project_root(project: Option<&Path>) -> Result<PathBuf> {
    let dir = match project {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    Ok(dir.canonicalize()?)
}

fn config_path(cli: &Cli, project: &Path) -> PathBuf {
    match &cli.config {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.clone()),
        None => project.join(DEFAULT_CONFIG_FILE),
    }
}

fn run(cli: &Cli, project: &Path) -> Result<ExitCode> {
    let command = cli.command.clone().unwrap_or(Command::Dev { port: None });

    if command == Command::Clean {
        let config = PipelineConfig::load(&config_path(cli, project))?;
        let paths = config.project_paths(project);
        let removed = clean_output(&paths.root, &paths.output)?;
        println!(
            "{} {}",
            if removed { "Removed" } else { "Already clean:" },
            paths.output.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let pipeline = Pipeline::load(project, Some(config_path(cli, project).as_path()))?;
    let jobs = cli.jobs.unwrap_or_else(|| pipeline.config.effective_jobs());

    match command {
        Command::Tasks => {
            print_tasks(&pipeline);
            Ok(ExitCode::SUCCESS)
        }
        Command::Build { json } => {
            pipeline.clean()?;
            let result = run_request(&pipeline, jobs, &RunRequest::release(), !json)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            Ok(exit_code(&result))
        }
        Command::Fonts => {
            let result = run_request(&pipeline, jobs, &RunRequest::group("fonts"), true)?;
            print_summary(&result);
            Ok(exit_code(&result))
        }
        Command::Run {
            tasks,
            only,
            release,
        } => {
            let request = if only {
                RunRequest::exact(tasks)
            } else {
                RunRequest::closure(tasks)
            }
            .with_release(release);
            let result = run_request(&pipeline, jobs, &request, true)?;
            print_summary(&result);
            Ok(exit_code(&result))
        }
        Command::Dev { port } => {
            pipeline.clean()?;
            let Pipeline {
                config,
                graph,
                registry,
            } = pipeline;
            let port = port.unwrap_or(config.server.port);
            let session = DevSession::new(config, graph, registry, jobs).with_port(port);

            let rt = tokio::runtime::Runtime::new()?;
            let initial = rt.block_on(async {
                let cancel = CancellationToken::new();
                let ctrl_c = cancel_on_ctrl_c(cancel.clone());
                let result = session.run(cancel.clone()).await;
                cancel.cancel();
                let _ = ctrl_c.await;
                result
            })?;
            klog!("Dev finished, initial build success={}", initial.success());
            Ok(ExitCode::SUCCESS)
        }
        Command::Clean => Ok(ExitCode::SUCCESS),
    }
}

/// Run one request on a fresh runtime, printing live status when `live`.
fn run_request(pipeline: &Pipeline, jobs: usize, request: &RunRequest, live: bool) -> Result<RunResult> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut scheduler = pipeline.scheduler(jobs);
        let printer = if live {
            let (tx, rx) = mpsc::unbounded_channel();
            scheduler = scheduler.with_events(tx);
            Some(spawn_status_printer(rx, Arc::new(OnceLock::new())))
        } else {
            None
        };
        let result = scheduler.run(request).await;
        drop(scheduler);
        if let Some(printer) = printer {
            printer
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;
        }
        result
    })
}

fn exit_code(result: &RunResult) -> ExitCode {
    if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_TASK_FAILED)
    }
}

fn print_tasks(pipeline: &Pipeline) {
    let graph = &pipeline.graph;
    for task in graph.topological_order() {
        let preds: Vec<&str> = graph
            .dependency_names(&task.name)
            .into_iter()
            .map(|n| n.as_str())
            .collect();
        let mut line = format!("{:<16} {:<14} -> {}", task.name, task.kind(), task.output);
        if let Some(group) = task.group() {
            line.push_str(&format!("  [{}]", group));
        }
        if task.is_release() {
            line.push_str("  (release)");
        }
        if !preds.is_empty() {
            line.push_str(&format!("  after: {}", preds.join(", ")));
        }
        println!("{}", line);
    }
}

fn print_summary(result: &RunResult) {
    println!();
    println!("Summary: {}", result.request);
    for report in &result.reports {
        let status = match &report.outcome {
            TaskOutcome::Succeeded { .. } => "ok",
            TaskOutcome::Failed { .. } => "FAILED",
            TaskOutcome::Skipped { .. } => "skipped",
        };
        let timing = report
            .duration()
            .map(|d| format!(" [{}]", format_duration(d)))
            .unwrap_or_default();
        println!("  {:<8} {:<16} {}{}", status, report.name, report.outcome, timing);
    }
    println!(
        "{} ok, {} failed, {} skipped in {}",
        result.succeeded_count(),
        result.failed().len(),
        result.skipped().len(),
        format_duration(result.duration())
    );
}
