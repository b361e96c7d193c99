use anyhow::Context;
use arboreal::config::{load_islands_config, load_run_config};
use arboreal::evolution::report::FitnessHistory;
use arboreal::island::{
    IslandBlueprint, IslandCoordinator, IslandWorker, IslandsOutcome, LocalIsland,
    MigrationOperator, RemoteIsland,
};
use arboreal::store::PopulationStore;
use arboreal::web_app::build_app;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arboreal", about = "Grammar-guided genetic programming with island migration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evolve a single population until it meets its termination condition.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Evolve a ring of islands with periodic migration.
    Islands {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Serve one island over HTTP for a remote coordinator.
    Worker {
        #[arg(long, env = "ARBOREAL_LISTEN", default_value = "0.0.0.0:7070")]
        listen: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print per-generation fitness statistics of a store.
    History {
        #[arg(long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run { config } => run(config).await,
        Command::Islands { config } => islands(config).await,
        Command::Worker { listen, config } => worker(listen, config).await,
        Command::History { store } => history(store),
    }
}

async fn run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_run_config(config.as_deref())?;
    let blueprint = IslandBlueprint::from_problem(config.evolver.clone(), config.problem)?;
    let store_path = config.evolver.store_path.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        let mut evolver = blueprint.build(store_path)?;
        evolver.run()
    })
    .await??;

    println!(
        "Stopped at generation {} ({:?}), best fitness {:e}",
        outcome.generation, outcome.reason, outcome.best.fitness
    );
    println!("{}", serde_json::to_string(&outcome.best.individual.tree)?);
    Ok(())
}

fn report(outcome: &IslandsOutcome) -> anyhow::Result<()> {
    if let Some((island, best)) = outcome.overall_best() {
        println!(
            "Stopped at generation {}, best fitness {:e} on island {}",
            outcome.generation,
            best.fitness,
            island + 1
        );
        println!("{}", serde_json::to_string(&best.individual.tree)?);
    }
    Ok(())
}

async fn islands(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_islands_config(config.as_deref())?;
    let migration = MigrationOperator::new(config.migration_probability);

    let outcome = if config.worker_endpoints.is_empty() {
        let blueprint = IslandBlueprint::from_problem(config.evolver.clone(), config.problem)?;
        let islands = (0..config.islands)
            .map(|i| LocalIsland::spawn(IslandWorker::new(blueprint.for_island(i))))
            .collect();
        info!("Running {} islands in-process", config.islands);
        IslandCoordinator::new(islands, config.store_path_template.clone(), migration)?
            .evolve()
            .await?
    } else {
        let islands = config
            .worker_endpoints
            .iter()
            .map(RemoteIsland::new)
            .collect();
        info!("Coordinating {} remote islands", config.worker_endpoints.len());
        IslandCoordinator::new(islands, config.store_path_template.clone(), migration)?
            .evolve()
            .await?
    };
    report(&outcome)
}

async fn worker(listen: String, config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_run_config(config.as_deref())?;
    let blueprint = IslandBlueprint::from_problem(config.evolver, config.problem)?;
    let app = build_app(Arc::new(Mutex::new(IslandWorker::new(blueprint))));

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("could not bind {listen}"))?;
    info!("Island worker listening on {}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn history(store: PathBuf) -> anyhow::Result<()> {
    let store = PopulationStore::open(&store)
        .with_context(|| format!("could not open {}", store.display()))?;
    let history = FitnessHistory::from_store(&store)?;
    print!("{history}");
    if let Some((generation, fitness)) = history.best() {
        println!("Best fitness {:e} in generation {}", fitness, generation);
    }
    Ok(())
}
