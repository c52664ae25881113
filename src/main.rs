//! Evo Fleet CLI - Run a node or one of its workers from JSON configuration.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use evo_fleet::{
    backend::{CommandEvaluator, GenomeGenerator, GenomeMutator, GenomeSimilarity},
    evolution::{Orchestrator, Worker},
    schema::FleetConfig,
};

#[derive(Parser)]
#[command(name = "evo-fleet", version, about = "Distributed tournament evolution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive this node through setup, init and every generation.
    Run {
        /// Path to the JSON configuration.
        #[arg(long)]
        config: PathBuf,
        /// Dotted key=value overrides, e.g. node_id=1.
        overrides: Vec<String>,
    },
    /// Evaluate this worker's share of the founding population.
    InitPopulation {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        worker_id: usize,
        overrides: Vec<String>,
    },
    /// Breed children until the current generation is complete.
    TournamentEvolution {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        worker_id: usize,
        overrides: Vec<String>,
    },
    /// Print a configuration with every default filled in.
    ExampleConfig,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config, overrides } => match load_config(&config, &overrides) {
            Some(config) => run_node(&config),
            None => 1,
        },
        Command::InitPopulation {
            config,
            worker_id,
            overrides,
        } => match load_config(&config, &overrides) {
            Some(config) => run_worker(&config, worker_id, false),
            None => 1,
        },
        Command::TournamentEvolution {
            config,
            worker_id,
            overrides,
        } => match load_config(&config, &overrides) {
            Some(config) => run_worker(&config, worker_id, true),
            None => 1,
        },
        Command::ExampleConfig => print_example_config(),
    };

    std::process::exit(code);
}

fn load_config(path: &Path, overrides: &[String]) -> Option<FleetConfig> {
    match FleetConfig::load(path, overrides) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Error loading config {}: {}", path.display(), e);
            None
        }
    }
}

fn run_node(config: &FleetConfig) -> i32 {
    let program = match std::env::current_exe() {
        Ok(program) => program,
        Err(e) => {
            log::error!("Cannot locate own executable: {}", e);
            return 1;
        }
    };

    log::info!(
        "Node {}/{} starting ({} workers, output {})",
        config.node_id,
        config.num_nodes,
        config.num_workers(),
        config.out_dir.display()
    );

    let generator = GenomeGenerator::new(config.genome.clone(), config.rng_seed);
    let mut similarity = GenomeSimilarity::new(config.genome.similarity_threshold);
    match Orchestrator::new(config, program).run(&generator, &mut similarity) {
        Ok(()) => {
            log::info!("Node {} done", config.node_id);
            0
        }
        Err(e) => {
            log::error!("Node {} failed: {}", config.node_id, e);
            1
        }
    }
}

fn run_worker(config: &FleetConfig, worker_id: usize, tournament: bool) -> i32 {
    let worker = Worker::new(config, worker_id);
    let evaluator = CommandEvaluator::new(&config.evaluator);

    let result = if tournament {
        let seed = worker.tournament_seed(config.evolution.current_generation);
        let mut mutator = GenomeMutator::new(config.genome.clone(), seed);
        worker.run_tournament_evolution(&evaluator, &mut mutator)
    } else {
        worker.run_init_population(&evaluator)
    };

    match result {
        Ok(summary) => {
            log::info!(
                "Worker {} exiting: {} succeeded, {} failed, {} skipped",
                worker_id,
                summary.succeeded,
                summary.failed,
                summary.skipped
            );
            0
        }
        Err(e) => {
            if let Err(marker_error) = worker.write_crash_marker(&e) {
                log::error!("Could not write crash marker: {}", marker_error);
            }
            1
        }
    }
}

fn print_example_config() -> i32 {
    match serde_json::to_string_pretty(&FleetConfig::default()) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error serializing example config: {}", e);
            1
        }
    }
}
