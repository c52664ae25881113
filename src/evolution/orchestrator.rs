//! Per-node phase driver.
//!
//! Every node runs the same state machine. The leader (node 0) builds the
//! deduplicated founding population while followers wait for its sentinel;
//! afterwards all nodes run the init phase and then one tournament phase
//! per generation, each phase ending when the shared population reaches
//! its size target.

use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::collaborators::{CandidateGenerator, CollaboratorError, SimilarityPredicate};
use super::dedup::{DedupEngine, DedupReport};
use super::store::{ArtifactKind, PopulationStore, SortBy, StoreError};
use super::supervisor::{ProcessSupervisor, SupervisorError, WorkerSpec};
use crate::schema::{CandidateId, ConfigError, FleetConfig};

/// Subcommand a worker runs during the init phase.
pub const INIT_POPULATION_COMMAND: &str = "init-population";
/// Subcommand a worker runs during a tournament phase.
pub const TOURNAMENT_EVOLUTION_COMMAND: &str = "tournament-evolution";

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("Failed to build generation pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Leader did not finish population setup within {0:?}")]
    LeaderTimeout(Duration),
}

/// Where a node is in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RoleDispatch,
    SetupPopulation,
    WaitForInit,
    InitPopulation,
    TournamentEvolution(usize),
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::RoleDispatch => write!(f, "role dispatch"),
            Phase::SetupPopulation => write!(f, "population setup"),
            Phase::WaitForInit => write!(f, "waiting for leader"),
            Phase::InitPopulation => write!(f, "init population"),
            Phase::TournamentEvolution(generation) => {
                write!(f, "tournament evolution (generation {})", generation)
            }
            Phase::Done => write!(f, "done"),
        }
    }
}

/// Drives one node through every phase.
pub struct Orchestrator<'a> {
    config: &'a FleetConfig,
    store: PopulationStore,
    /// Executable re-invoked with a phase subcommand for each worker.
    worker_program: PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new<P: Into<PathBuf>>(config: &'a FleetConfig, worker_program: P) -> Self {
        Self {
            config,
            store: PopulationStore::new(&config.out_dir),
            worker_program: worker_program.into(),
        }
    }

    pub fn store(&self) -> &PopulationStore {
        &self.store
    }

    /// Phase following `phase` on this node.
    pub fn next_phase(&self, phase: Phase) -> Phase {
        let generations = self.config.evolution.num_generations;
        match phase {
            Phase::RoleDispatch if self.config.is_leader() => Phase::SetupPopulation,
            Phase::RoleDispatch => Phase::WaitForInit,
            Phase::SetupPopulation | Phase::WaitForInit => Phase::InitPopulation,
            Phase::InitPopulation if generations > 0 => Phase::TournamentEvolution(0),
            Phase::TournamentEvolution(g) if g + 1 < generations => {
                Phase::TournamentEvolution(g + 1)
            }
            Phase::InitPopulation | Phase::TournamentEvolution(_) | Phase::Done => Phase::Done,
        }
    }

    /// Create the category folders and dump the effective configuration.
    ///
    /// Only the leader writes the dump; followers read the same file once
    /// the setup sentinel shows it is complete.
    pub fn setup_output_dir(&self) -> Result<PathBuf, OrchestratorError> {
        self.store.ensure_layout()?;
        if !self.config.is_leader() {
            return Ok(self.config.dump_path());
        }
        // Followers may already be reading it.
        if self.store.setup_done() {
            let path = self.config.dump_path();
            log::info!("Setup already done, keeping {}", path.display());
            return Ok(path);
        }
        let path = self.config.dump()?;
        log::info!("Configuration written to {}", path.display());
        Ok(path)
    }

    /// Run every phase to completion.
    pub fn run(
        &self,
        generator: &dyn CandidateGenerator,
        similarity: &mut dyn SimilarityPredicate,
    ) -> Result<(), OrchestratorError> {
        self.setup_output_dir()?;

        let mut phase = Phase::RoleDispatch;
        while phase != Phase::Done {
            let started = Instant::now();
            log::info!("Node {} entering {}", self.config.node_id, phase);
            match phase {
                Phase::RoleDispatch | Phase::Done => {}
                Phase::SetupPopulation => {
                    self.setup_population(generator, similarity)?;
                }
                Phase::WaitForInit => self.wait_for_init()?,
                Phase::InitPopulation => self.init_population()?,
                Phase::TournamentEvolution(generation) => {
                    self.tournament_evolution(generation)?
                }
            }
            log::info!("Node {} finished {} in {:?}", self.config.node_id, phase, started.elapsed());
            phase = self.next_phase(phase);
        }
        Ok(())
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Generate the oversampled batch and deduplicate it down to size.
    ///
    /// Does nothing once the sentinel exists. Definitions left behind by an
    /// interrupted setup take part in deduplication alongside the new batch.
    pub fn setup_population(
        &self,
        generator: &dyn CandidateGenerator,
        similarity: &mut dyn SimilarityPredicate,
    ) -> Result<DedupReport, OrchestratorError> {
        if self.store.setup_done() {
            log::info!("Population already set up");
            return Ok(DedupReport {
                skipped: true,
                ..Default::default()
            });
        }

        let generated = self.generate_batch(generator)?;
        log::info!("Generated {} candidates", generated.len());

        let ids = self
            .store
            .list_ids(ArtifactKind::Definition, None, SortBy::Name)?;
        if ids.len() > generated.len() {
            log::warn!(
                "{} definitions from an earlier setup attempt included",
                ids.len() - generated.len()
            );
        }

        let target = self.config.evolution.init_population_size;
        let mut engine = DedupEngine::new(&self.store, target, self.config.rng_seed);
        let report = engine.run(&ids, similarity)?;
        log::info!(
            "Kept {} of {} candidates ({} clusters, {} padded)",
            report.kept.len(),
            ids.len(),
            report.components,
            report.padded
        );
        Ok(report)
    }

    /// Create `setup_batch_size` candidates on a bounded thread pool.
    ///
    /// Returns the ids that were generated successfully; failures are logged
    /// and left out.
    pub fn generate_batch(
        &self,
        generator: &dyn CandidateGenerator,
    ) -> Result<Vec<CandidateId>, OrchestratorError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.evolution.num_cpu_processes)
            .build()?;

        let node_id = self.config.node_id;
        let store = &self.store;
        let results: Vec<(CandidateId, Result<(), CollaboratorError>)> = pool.install(|| {
            (0..self.config.setup_batch_size())
                .into_par_iter()
                .map(|index| {
                    let id = CandidateId::stamped(node_id, index);
                    let result = generator.generate(&id, store);
                    (id, result)
                })
                .collect()
        });

        let mut generated = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(()) => generated.push(id),
                Err(CollaboratorError::Store(e)) => return Err(e.into()),
                Err(e) => log::warn!("Failed to generate {}: {}", id, e),
            }
        }
        Ok(generated)
    }

    /// Block until the leader's sentinel appears.
    pub fn wait_for_init(&self) -> Result<(), OrchestratorError> {
        let timeout = self.config.timing.leader_wait_timeout();
        let interval = self.config.timing.sentinel_poll();
        let start = Instant::now();

        while !self.store.setup_done() {
            if start.elapsed() >= timeout {
                log::error!("Leader did not set up the population within {:?}", timeout);
                return Err(OrchestratorError::LeaderTimeout(timeout));
            }
            log::info!("Waiting for leader to finish population setup");
            thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
        }
        Ok(())
    }

    // ========================================================================
    // Worker phases
    // ========================================================================

    /// Evaluate the founders.
    pub fn init_population(&self) -> Result<(), OrchestratorError> {
        let target = self.config.evolution.init_population_size;
        self.run_workers(INIT_POPULATION_COMMAND, &[], target)
    }

    /// Breed one generation.
    pub fn tournament_evolution(&self, generation: usize) -> Result<(), OrchestratorError> {
        let target = self.config.generation_target(generation);
        let overrides = [format!("evolution.current_generation={}", generation)];
        self.run_workers(TOURNAMENT_EVOLUTION_COMMAND, &overrides, target)
    }

    /// Launch this node's workers and supervise them until `target`.
    fn run_workers(
        &self,
        command: &str,
        overrides: &[String],
        target: usize,
    ) -> Result<(), OrchestratorError> {
        let size = self.store.size()?;
        if size >= target {
            log::info!("Population already at {} (target {}), skipping", size, target);
            return Ok(());
        }

        let mut supervisor = ProcessSupervisor::new(
            self.config.node_id,
            self.store.clone(),
            self.config.timing.poll_interval(),
        );
        for worker_id in 0..self.config.num_workers() {
            supervisor.spawn(self.worker_spec(command, worker_id, overrides))?;
        }

        let store = &self.store;
        supervisor.supervise(|| -> Result<bool, OrchestratorError> {
            let size = store.size()?;
            log::debug!("Population size {} / {}", size, target);
            Ok(size >= target)
        })
    }

    /// How worker `worker_id` of this node is launched for `command`.
    pub fn worker_spec(&self, command: &str, worker_id: usize, overrides: &[String]) -> WorkerSpec {
        let gpu = worker_id % self.config.evolution.num_gpus.max(1);
        WorkerSpec::new(worker_id, &self.worker_program)
            .arg(command)
            .arg("--config")
            .arg(self.config.dump_path().to_string_lossy())
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg(format!("node_id={}", self.config.node_id))
            .args(overrides.iter().cloned())
            .env("CUDA_VISIBLE_DEVICES", gpu.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct TouchGenerator {
        calls: AtomicUsize,
    }

    impl CandidateGenerator for TouchGenerator {
        fn generate(&self, id: &CandidateId, store: &PopulationStore) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if id.index() == 3 {
                return Err(CollaboratorError::InvalidRepresentation {
                    id: id.clone(),
                    reason: "unlucky".to_string(),
                });
            }
            for kind in [ArtifactKind::Definition, ArtifactKind::InitState] {
                fs::write(store.path(id, kind), b"x").map_err(|e| {
                    CollaboratorError::InvalidRepresentation {
                        id: id.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
            Ok(())
        }
    }

    /// Pairs of consecutive indices are duplicates.
    struct Pairs;

    impl SimilarityPredicate for Pairs {
        fn similar(&self, a: &CandidateId, b: &CandidateId) -> bool {
            a.index() / 2 == b.index() / 2
        }
    }

    fn config(root: &std::path::Path) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.out_dir = root.to_path_buf();
        config.evolution.init_population_size = 4;
        config.evolution.oversample_factor = 3;
        config.evolution.num_generations = 2;
        config.evolution.tournaments_per_gen = 5;
        config.evolution.num_gpus = 2;
        config.evolution.workers_per_gpu = 2;
        config.evolution.num_cpu_processes = 2;
        config.timing.sentinel_poll_secs = 0.02;
        config.timing.leader_wait_timeout_secs = 0.1;
        config
    }

    #[test]
    fn test_phase_sequence() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        let orchestrator = Orchestrator::new(&config, "evo-fleet");

        let mut phase = Phase::RoleDispatch;
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = orchestrator.next_phase(phase);
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::RoleDispatch,
                Phase::SetupPopulation,
                Phase::InitPopulation,
                Phase::TournamentEvolution(0),
                Phase::TournamentEvolution(1),
                Phase::Done,
            ]
        );

        config.num_nodes = 2;
        config.node_id = 1;
        let follower = Orchestrator::new(&config, "evo-fleet");
        assert_eq!(follower.next_phase(Phase::RoleDispatch), Phase::WaitForInit);
    }

    #[test]
    fn test_setup_population_generates_and_dedups() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let orchestrator = Orchestrator::new(&config, "evo-fleet");
        orchestrator.setup_output_dir().unwrap();

        let generator = TouchGenerator {
            calls: AtomicUsize::new(0),
        };
        let report = orchestrator.setup_population(&generator, &mut Pairs).unwrap();

        assert_eq!(generator.calls.load(Ordering::SeqCst), 12);
        assert_eq!(report.kept.len(), 4);
        assert_eq!(report.removed.len(), 7);
        assert_eq!(report.components, 6);
        assert!(orchestrator.store().setup_done());
        assert!(config.dump_path().exists());

        let again = orchestrator.setup_population(&generator, &mut Pairs).unwrap();
        assert!(again.skipped);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_leader_restart_keeps_config_dump() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let orchestrator = Orchestrator::new(&config, "evo-fleet");
        let path = orchestrator.setup_output_dir().unwrap();
        orchestrator.store().mark_setup_done().unwrap();

        let published = r#"{"node_id": 0}"#;
        fs::write(&path, published).unwrap();

        let restarted = Orchestrator::new(&config, "evo-fleet");
        assert_eq!(restarted.setup_output_dir().unwrap(), path);
        assert_eq!(fs::read_to_string(&path).unwrap(), published);
    }

    #[test]
    fn test_follower_times_out_without_sentinel() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.num_nodes = 2;
        config.node_id = 1;
        let orchestrator = Orchestrator::new(&config, "evo-fleet");

        let err = orchestrator.wait_for_init().unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaderTimeout(_)));
    }

    #[test]
    fn test_follower_proceeds_once_sentinel_exists() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.num_nodes = 2;
        config.node_id = 1;
        let orchestrator = Orchestrator::new(&config, "evo-fleet");
        orchestrator.store().mark_setup_done().unwrap();
        orchestrator.wait_for_init().unwrap();
    }

    #[test]
    fn test_worker_spec_assigns_gpus() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let orchestrator = Orchestrator::new(&config, "/usr/bin/evo-fleet");

        let overrides = vec!["evolution.current_generation=1".to_string()];
        let spec = orchestrator.worker_spec(TOURNAMENT_EVOLUTION_COMMAND, 3, &overrides);
        assert_eq!(spec.worker_id, 3);
        assert_eq!(spec.args[0], TOURNAMENT_EVOLUTION_COMMAND);
        assert!(spec.args.contains(&"--worker-id".to_string()));
        assert!(spec.args.contains(&"3".to_string()));
        assert!(spec.args.contains(&"node_id=0".to_string()));
        assert_eq!(spec.args.last(), Some(&overrides[0]));
        assert_eq!(
            spec.envs,
            vec![("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_completed_phase_is_skipped() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        // A program that cannot be spawned proves no worker is launched.
        let orchestrator = Orchestrator::new(&config, dir.path().join("missing"));
        orchestrator.setup_output_dir().unwrap();

        for i in 0..4 {
            let id = CandidateId::new(0, i, "t");
            orchestrator
                .store()
                .write_metadata(&crate::schema::Metadata::root(id, 1.0, 1.0))
                .unwrap();
        }
        orchestrator.init_population().unwrap();
        assert!(matches!(
            orchestrator.tournament_evolution(0),
            Err(OrchestratorError::Supervisor(SupervisorError::Spawn { .. }))
        ));
    }
}
