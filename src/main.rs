//! Aspect Bench CLI
//!
//! Runs KB-context experiments, materializes prompts and renders reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use aspect_bench::config::{BenchConfig, ProviderKind, Validate};
use aspect_bench::error::{Error, Result};
use aspect_bench::experiment::{ExperimentPlan, ExperimentRunner, Selection};
use aspect_bench::prompt::{Condition, PromptCompiler, PromptStore};
use aspect_bench::registry::{RepoRegistry, TaskRegistry};
use aspect_bench::store::{list_experiments, new_experiment_id, ExperimentStore};
use aspect_bench::suite::PytestRunner;
use aspect_bench::trial::TrialExecutor;
use aspect_bench::{provider, report, workspace};

#[derive(Parser)]
#[command(name = "aspect-bench", version, about = "KB-context benchmark harness")]
struct Cli {
    /// Configuration file (defaults to ./aspect-bench.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    /// Repository to include; repeatable.
    #[arg(long = "repo")]
    repos: Vec<String>,
    /// Include every configured repository.
    #[arg(long)]
    all_repos: bool,
    /// Comma-separated task ids (default: all tasks).
    #[arg(long, value_delimiter = ',')]
    tasks: Option<Vec<String>>,
    /// Comma-separated conditions (default: from configuration).
    #[arg(long, value_delimiter = ',')]
    conditions: Option<Vec<Condition>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) an experiment.
    Run {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        provider: Option<ProviderKind>,
        #[arg(long)]
        model: Option<String>,
        /// Resume this experiment instead of starting a new one.
        #[arg(long)]
        experiment_id: Option<String>,
        /// Trials run concurrently.
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Compile and store prompts for every task × condition pair.
    Prompts {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Render a stored experiment as markdown.
    Report {
        /// Experiment to render (default: the most recent).
        #[arg(long)]
        experiment_id: Option<String>,
        /// Output file (default: stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List tasks.
    Tasks {
        #[arg(long = "repo")]
        repos: Vec<String>,
    },
    /// List configured repositories.
    Repos,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "aborted");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BenchConfig::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            selection,
            provider,
            model,
            experiment_id,
            parallel,
        } => {
            if let Some(kind) = provider {
                config.provider.kind = kind;
            }
            if model.is_some() {
                config.provider.model = model;
            }
            if let Some(parallel) = parallel {
                config.run.parallelism = parallel;
            }
            run_experiment(&config, &selection, experiment_id).await
        }
        Commands::Prompts { selection } => {
            validate(&config)?;
            let registry = config.registry()?;
            let selection = resolve_selection(&config, &registry, &selection)?;
            let tasks = TaskRegistry::load(&registry, &selection.repos)?;
            let compiler = compiler(&config, &selection.conditions)?;
            let store = PromptStore::new(config.paths.prompts_dir.clone());
            let plan = ExperimentPlan::build(&registry, &tasks, &compiler, selection, Some(&store))?;
            println!("Wrote {} prompts to {}", plan.len(), store.root().display());
            Ok(())
        }
        Commands::Report {
            experiment_id,
            output,
        } => render_report(&config, experiment_id, output.as_deref()),
        Commands::Tasks { repos } => {
            let registry = config.registry()?;
            let names = if repos.is_empty() {
                registry.names().to_vec()
            } else {
                repos
            };
            let tasks = TaskRegistry::load(&registry, &names)?;
            for name in &names {
                println!("{}:", name);
                for task in tasks.tasks(name)? {
                    let difficulty = task
                        .difficulty
                        .map(|d| format!("{:?}", d).to_lowercase())
                        .unwrap_or_else(|| "-".to_string());
                    println!("  {:<32} {:<8} {}", task.id, difficulty, task.name);
                }
            }
            Ok(())
        }
        Commands::Repos => {
            let registry = config.registry()?;
            for repo in registry.iter() {
                let partner = registry
                    .swap_partner(&repo.name)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|_| "-".to_string());
                println!(
                    "{:<20} {:<32} swap={:<20} {}",
                    repo.name,
                    repo.display_name,
                    partner,
                    repo.root.display()
                );
            }
            Ok(())
        }
    }
}

fn validate(config: &BenchConfig) -> Result<()> {
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }
    Ok(())
}

fn resolve_selection(
    config: &BenchConfig,
    registry: &RepoRegistry,
    args: &SelectionArgs,
) -> Result<Selection> {
    let repos = if args.all_repos || args.repos.is_empty() {
        registry.names().to_vec()
    } else {
        for name in &args.repos {
            registry.get(name)?;
        }
        args.repos.clone()
    };

    Ok(Selection {
        repos,
        tasks: args.tasks.clone(),
        conditions: args
            .conditions
            .clone()
            .unwrap_or_else(|| config.run.conditions.clone()),
    })
}

/// The shared instructions file is only read when a KB condition needs it.
fn compiler(config: &BenchConfig, conditions: &[Condition]) -> Result<PromptCompiler> {
    if conditions.iter().any(|c| c.uses_kb()) {
        PromptCompiler::from_instructions_file(&config.paths.instructions_file)
    } else {
        Ok(PromptCompiler::new(String::new()))
    }
}

async fn run_experiment(
    config: &BenchConfig,
    args: &SelectionArgs,
    experiment_id: Option<String>,
) -> Result<()> {
    validate(config)?;
    let registry = config.registry()?;
    let selection = resolve_selection(config, &registry, args)?;
    let tasks = TaskRegistry::load(&registry, &selection.repos)?;
    let compiler = compiler(config, &selection.conditions)?;
    let prompts = PromptStore::new(config.paths.prompts_dir.clone());
    let plan = ExperimentPlan::build(&registry, &tasks, &compiler, selection, Some(&prompts))?;

    let provider = provider::from_config(&config.provider)?;

    let store = match experiment_id {
        Some(id) => ExperimentStore::open(&config.paths.results_dir, &id)?,
        None => ExperimentStore::open(&config.paths.results_dir, &new_experiment_id())?,
    };
    let store = Arc::new(store);

    let executor = TrialExecutor::new(
        provider,
        Arc::new(PytestRunner::new()),
        workspace::from_config(&config.run, &config.paths.workspaces_dir),
        Arc::clone(&store),
    )
    .with_provider_config(config.provider.clone())
    .with_retry(config.retry.clone())
    .with_test_timeout(config.run.test_timeout());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight trials");
            let _ = cancel_tx.send(true);
        }
    });

    let runner = ExperimentRunner::new(executor, config.run.parallelism);
    let summary = runner.run(&plan, cancel_rx).await?;

    let record = store.record()?;
    let report_path = store.dir().join("report.md");
    report::write(&record, &report_path)?;

    println!("{}", summary);
    println!("Results: {}", store.dir().display());
    Ok(())
}

fn render_report(config: &BenchConfig, experiment_id: Option<String>, output: Option<&Path>) -> Result<()> {
    let results_dir = &config.paths.results_dir;
    let id = match experiment_id {
        Some(id) => id,
        None => list_experiments(results_dir)?.pop().ok_or_else(|| {
            Error::Config(format!("no experiments in {}", results_dir.display()))
        })?,
    };

    let store = ExperimentStore::open_existing(results_dir, &id)?;
    let record = store.record()?;
    match output {
        Some(path) => report::write(&record, path),
        None => {
            print!("{}", report::render(&record));
            Ok(())
        }
    }
}
