use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use patchbench::agent::CommandAgentLauncher;
use patchbench::config::{CliOverrides, RunConfig};
use patchbench::dataset::{Dataset, IndexRange};
use patchbench::lab::executor::TrialExecutor;
use patchbench::lab::{Dispatcher, RepoCache, RetryController, RetryPolicy, RunSummary};
use patchbench::store::{load_finished_instances, ResultStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "patchbench",
    about = "Run a code-editing agent over issue/patch benchmark instances in disposable sandboxes",
    version
)]
struct Cli {
    /// Config file (defaults to ./patchbench.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Solve the selected instances and append predictions to the output file
    Run(RunArgs),
    /// List the selected instances without running anything
    Problems(ProblemsArgs),
}

#[derive(Args, Debug, Default)]
struct DatasetArgs {
    /// Dataset file (JSON array, id-keyed JSON object, or JSON Lines)
    #[arg(long)]
    dataset: Option<PathBuf>,
    /// Base URL for `owner/name` repo values
    #[arg(long)]
    github_base_url: Option<String>,
}

#[derive(Args, Debug, Default)]
struct SelectionArgs {
    /// Only these instance ids (repeatable)
    #[arg(long = "instance")]
    instances: Vec<String>,
    /// Regex over instance ids
    #[arg(long)]
    filter: Option<String>,
    /// Index range into the selection, e.g. `0..50` or `100..`
    #[arg(long)]
    slice: Option<IndexRange>,
    /// Random sample of this many instances
    #[arg(long)]
    sample: Option<usize>,
    /// Seed for --sample
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long)]
    run_id: Option<String>,
    /// Predictions file (default: predictions/<run_id>.json)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Model to try, in order (repeatable)
    #[arg(long = "model")]
    models: Vec<String>,
    /// Identity written to every prediction (default: first model)
    #[arg(long)]
    model_name_or_path: Option<String>,
    /// Attempts per instance; every model is tried on each attempt
    #[arg(long)]
    num_tries: Option<usize>,
    /// Instances processed in parallel
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    temperature: Option<f64>,
    /// Bare repository cache
    #[arg(long)]
    repos_dir: Option<PathBuf>,
    #[arg(long)]
    chat_logs_dir: Option<PathBuf>,
    /// Parent directory for sandboxes (default: system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
    /// Earlier predictions files or directories; their instances are skipped (repeatable)
    #[arg(long = "prior-results")]
    prior_results: Vec<PathBuf>,
    /// Re-run instances already present in the output file
    #[arg(long)]
    no_resume: bool,
    /// Agent program started for every instruction
    #[arg(long)]
    agent_program: Option<String>,
    /// Agent argument template (repeatable)
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,
    #[arg(long)]
    agent_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct ProblemsArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[command(flatten)]
    selection: SelectionArgs,
}

impl SelectionArgs {
    fn apply(self, overrides: &mut CliOverrides) {
        overrides.instance_ids = self.instances;
        overrides.filter = self.filter;
        overrides.slice = self.slice;
        overrides.sample = self.sample;
        overrides.seed = self.seed;
    }
}

impl RunArgs {
    fn into_overrides(self) -> CliOverrides {
        let mut overrides = CliOverrides {
            run_id: self.run_id,
            dataset: self.dataset.dataset,
            output: self.output,
            models: self.models,
            model_name_or_path: self.model_name_or_path,
            num_tries: self.num_tries,
            concurrency: self.concurrency,
            temperature: self.temperature,
            repos_dir: self.repos_dir,
            chat_logs_dir: self.chat_logs_dir,
            scratch_dir: self.scratch_dir,
            prior_results: self.prior_results,
            no_resume: self.no_resume,
            github_base_url: self.dataset.github_base_url,
            agent_program: self.agent_program,
            agent_args: self.agent_args,
            agent_timeout_secs: self.agent_timeout_secs,
            ..Default::default()
        };
        self.selection.apply(&mut overrides);
        overrides
    }
}

impl ProblemsArgs {
    fn into_overrides(self) -> CliOverrides {
        let mut overrides = CliOverrides {
            dataset: self.dataset.dataset,
            github_base_url: self.dataset.github_base_url,
            ..Default::default()
        };
        self.selection.apply(&mut overrides);
        overrides
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    run_id: &'a str,
    finished_at: DateTime<Utc>,
    predictions: &'a Path,
    config: &'a RunConfig,
    summary: &'a RunSummary,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => run_benchmark(cli.config.as_deref(), args).await,
        Commands::Problems(args) => show_problems(cli.config.as_deref(), args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("patchbench=debug")
        } else {
            EnvFilter::new("patchbench=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run_benchmark(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = RunConfig::resolve(config_path, args.into_overrides())?;
    config.require_agent()?;

    let dataset = Dataset::load(&config.dataset, &config.github_base_url)?;
    let instances = dataset.select(&config.selection)?;
    let store = Arc::new(ResultStore::new(&config.output));
    let mut finished = load_finished_instances(&config.prior_results)?;
    if config.resume {
        finished.extend(store.finished_instances()?);
    }

    let cache = Arc::new(RepoCache::new(&config.repos_dir));
    let launcher = Arc::new(CommandAgentLauncher::new(config.agent.clone()));
    let mut controller = RetryController::new(
        cache,
        TrialExecutor::new(launcher, config.temperature),
        RetryPolicy {
            models: config.models.clone(),
            num_tries: config.num_tries,
        },
        config.identity(),
    )
    .with_chat_log_dir(config.chat_log_dir());
    if let Some(scratch) = &config.scratch_dir {
        controller = controller.with_scratch_root(scratch);
    }

    info!(
        run_id = %config.run_id,
        dataset = %config.dataset.display(),
        output = %config.output.display(),
        selected = instances.len(),
        models = ?config.models,
        num_tries = config.num_tries,
        "starting run"
    );
    let summary = Dispatcher::new(Arc::new(controller), Arc::clone(&store), config.concurrency)
        .with_finished(finished)
        .run(instances)
        .await?;

    let report_path = store.report_path();
    write_report_json(
        &report_path,
        &RunReport {
            run_id: &config.run_id,
            finished_at: Utc::now(),
            predictions: &config.output,
            config: &config,
            summary: &summary,
        },
    )?;
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        plausible = summary.plausible,
        fallback = summary.fallback,
        no_winner = summary.no_winner,
        total_cost = summary.total_cost,
        "run finished"
    );

    println!("Run ID: {}", config.run_id);
    println!("Requested: {}", summary.requested);
    println!("Skipped: {}", summary.skipped);
    println!("Processed: {}", summary.processed);
    println!("Plausible: {}", summary.plausible);
    println!("Fallback: {}", summary.fallback);
    println!("No winner: {}", summary.no_winner);
    println!("Total cost: {:.4}", summary.total_cost);
    println!("Predictions: {}", config.output.display());
    println!("Report: {}", report_path.display());
    Ok(())
}

fn show_problems(config_path: Option<&Path>, args: ProblemsArgs) -> Result<()> {
    let config = RunConfig::resolve(config_path, args.into_overrides())?;
    let dataset = Dataset::load(&config.dataset, &config.github_base_url)?;
    for instance in dataset.select(&config.selection)? {
        println!("{}: {}", instance.instance_id, instance.headline());
    }
    Ok(())
}

fn write_report_json<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory '{}'", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report '{}'", path.display()))?;
    Ok(())
}
