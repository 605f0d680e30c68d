//! `felix`: run, check and inspect PRD task plans.

mod config;

use clap::{Args, Parser, Subcommand};
use config::FelixConfig;
use felix_agent::{
    DefaultWorkerFactory, FallbackRouter, HealthMonitor, ModelCatalog, ModelRegistry,
};
use felix_core::{EventBus, Prd};
use felix_orchestrator::{
    compute_levels, ExecutionMode, ModelRouter, Orchestrator, OrchestratorConfig,
};
use felix_session::{SqliteStore, Stores};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "felix", version, about = "Felix: autonomous PRD task orchestrator")]
struct Cli {
    /// Path to config file (defaults to ./felix.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan
    Run(RunArgs),
    /// Check a plan and print its dependency levels
    Validate {
        /// Plan file (JSON)
        prd: PathBuf,
    },
    /// Print the model each task would be routed to
    Route {
        /// Plan file (JSON)
        prd: PathBuf,
    },
    /// Probe every provider's CLI
    Health,
}

#[derive(Args)]
struct RunArgs {
    /// Plan file (JSON)
    prd: PathBuf,
    /// Ask workers to plan without touching files; no checkpoints are written
    #[arg(long)]
    dry_run: bool,
    /// Cost ceiling in USD
    #[arg(long)]
    max_cost: Option<f64>,
    /// Execute at most this many tasks
    #[arg(long)]
    max_tasks: Option<usize>,
    /// Tasks in flight at once
    #[arg(long)]
    max_parallel: Option<usize>,
    /// sequential, bounded_parallel or hierarchical
    #[arg(long)]
    mode: Option<ExecutionMode>,
    /// Pin every task to one model
    #[arg(long)]
    model: Option<String>,
    /// Keep going after a task fails
    #[arg(long)]
    continue_on_failure: bool,
    /// Neither resume from nor write checkpoints
    #[arg(long)]
    no_checkpoint: bool,
    /// Directory workers operate in
    #[arg(long)]
    workdir: Option<PathBuf>,
}

impl RunArgs {
    /// Flags win over every other configuration layer.
    fn apply(&self, config: &mut OrchestratorConfig) {
        let execution = &mut config.execution;
        if self.dry_run {
            execution.dry_run = true;
        }
        if self.max_cost.is_some() {
            execution.max_cost_usd = self.max_cost;
        }
        if self.max_tasks.is_some() {
            execution.max_tasks = self.max_tasks;
        }
        if let Some(n) = self.max_parallel {
            execution.max_parallel_tasks = n;
        }
        if self.mode.is_some() {
            execution.mode = self.mode;
        }
        if self.model.is_some() {
            execution.model.clone_from(&self.model);
        }
        if self.continue_on_failure {
            execution.continue_on_failure = true;
        }
        if self.no_checkpoint {
            execution.enable_checkpoints = false;
        }
        if let Some(dir) = &self.workdir {
            execution.working_dir.clone_from(dir);
        }
    }
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.compact().init();
    } else {
        builder.json().init();
    }
}

async fn open_stores(data_dir: &Path) -> anyhow::Result<Stores> {
    tokio::fs::create_dir_all(data_dir).await.map_err(|e| {
        anyhow::anyhow!("Failed to create data dir '{}': {}", data_dir.display(), e)
    })?;
    let store = SqliteStore::open(&data_dir.join("felix.db")).await?;
    Ok(Stores::shared(Arc::new(store)))
}

async fn run(config: FelixConfig, args: RunArgs) -> anyhow::Result<i32> {
    let prd = Prd::load(&args.prd)?;
    let mut settings = config.orchestrator.clone();
    settings.apply_prd(&prd.config);
    args.apply(&mut settings);

    let stores = open_stores(&config.data_dir).await?;
    let catalog = Arc::new(ModelCatalog::default());
    let factory = Arc::new(DefaultWorkerFactory::new(catalog.clone()));
    let registry = Arc::new(ModelRegistry::new(catalog.clone(), factory, config.model.clone()));
    let health = Arc::new(HealthMonitor::with_cli_probe(config.health.clone()));
    let events = EventBus::new();
    let source = FallbackRouter::new(registry, health, config.fallback.clone(), config.primary())
        .with_events(events.clone());

    let mut orchestrator = Orchestrator::new(
        prd,
        settings,
        Arc::new(source),
        catalog,
        config.primary(),
        stores,
    )?
    .with_events(events);

    let control = orchestrator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight tasks before stopping");
            control.cancel();
        }
    });

    let result = orchestrator.run().await?;
    println!("{}", result.summary());
    Ok(result.exit_code())
}

fn validate(path: &Path) -> anyhow::Result<i32> {
    let prd = match Prd::load(path) {
        Ok(prd) => prd,
        Err(e) => {
            eprintln!("{e}");
            return Ok(1);
        }
    };
    let levels = compute_levels(&prd.tasks)?;
    println!(
        "{}: {} task(s) in {} level(s), plan {}",
        prd.project,
        prd.tasks.len(),
        levels.len(),
        &prd.plan_hash()[..12]
    );
    for (i, level) in levels.iter().enumerate() {
        println!("  level {i}: {}", level.join(", "));
    }
    Ok(0)
}

async fn route(config: FelixConfig, path: &Path) -> anyhow::Result<i32> {
    let prd = Prd::load(path)?;
    let mut settings = config.orchestrator.clone();
    settings.apply_prd(&prd.config);

    let stores = open_stores(&config.data_dir).await?;
    let router = ModelRouter::new(
        settings.router.clone(),
        Arc::new(ModelCatalog::default()),
        config.primary(),
    )
    .with_patterns(stores.patterns.clone())
    .with_model_override(settings.execution.model.clone());
    let patterns = router.load_history().await?;
    info!(patterns, "Routing history loaded");

    for d in router.route_all(&prd.tasks)? {
        println!(
            "{:<24} {:<20} {:<8} {:<8} score {:>3}",
            d.task_id,
            d.selected_model,
            d.tier.to_string(),
            d.source.to_string(),
            d.score
        );
    }
    Ok(0)
}

async fn health(config: FelixConfig) -> anyhow::Result<i32> {
    let (primary, _) = config.primary();
    let monitor = HealthMonitor::with_cli_probe(config.health);
    let mut primary_ok = false;
    for h in monitor.check_all().await {
        let verdict = if h.available { "ok" } else { "unavailable" };
        match &h.last_error {
            Some(err) if !h.available => println!("{:<10} {verdict} ({err})", h.provider.to_string()),
            _ => println!("{:<10} {verdict}", h.provider.to_string()),
        }
        if h.provider == primary {
            primary_ok = h.available;
        }
    }
    Ok(if primary_ok { 0 } else { 1 })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = FelixConfig::load(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Run(args) => run(config, args).await?,
        Commands::Validate { prd } => validate(&prd)?,
        Commands::Route { prd } => route(config, &prd).await?,
        Commands::Health => health(config).await?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
