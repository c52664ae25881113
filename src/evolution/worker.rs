//! Worker process loops for the two evaluation phases.
//!
//! A worker is started by its node's supervisor with the dumped
//! configuration and a worker id. It evaluates candidates until the shared
//! population reaches the phase target, writing exactly one terminal record
//! per candidate. Evaluation failures are recorded and skipped; anything
//! that threatens the store's invariants is fatal.

use std::thread;
use std::time::{Duration, Instant};

use super::collaborators::{
    CollaboratorError, EvaluationRequest, Evaluator, MutationOperator,
};
use super::partition::worker_shard;
use super::selection::TournamentSelector;
use super::store::{ArtifactKind, PopulationStore, SortBy, StoreError};
use crate::schema::{CandidateId, ErrorMetadata, FleetConfig, Metadata};

/// Fatal worker errors. The process writes its crash marker and exits.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// Terminal record written for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Success(Metadata),
    Failure(ErrorMetadata),
}

impl Recorded {
    pub fn is_success(&self) -> bool {
        matches!(self, Recorded::Success(_))
    }
}

/// Counters reported when a worker loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl WorkerSummary {
    fn count(&mut self, recorded: &Recorded) {
        if recorded.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// One worker process on one node.
pub struct Worker<'a> {
    config: &'a FleetConfig,
    store: PopulationStore,
    worker_id: usize,
}

impl<'a> Worker<'a> {
    pub fn new(config: &'a FleetConfig, worker_id: usize) -> Self {
        Self {
            config,
            store: PopulationStore::new(&config.out_dir),
            worker_id,
        }
    }

    pub fn store(&self) -> &PopulationStore {
        &self.store
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    // ========================================================================
    // Init population
    // ========================================================================

    /// Evaluate this worker's share of the founding population.
    ///
    /// The founders are the oldest `init_population_size` definitions,
    /// ordered by id and sliced first by node and then by worker.
    pub fn run_init_population(
        &self,
        evaluator: &dyn Evaluator,
    ) -> Result<WorkerSummary, WorkerError> {
        let target = self.config.evolution.init_population_size;
        let mut founders = self
            .store
            .list_ids(ArtifactKind::Definition, None, SortBy::ModifiedTime)?;
        founders.truncate(target);
        founders.sort();

        let shard = worker_shard(
            &founders,
            self.config.num_nodes,
            self.config.node_id,
            self.config.num_workers(),
            self.worker_id,
        );
        log::info!(
            "Worker {}/{} evaluating {} of {} founders",
            self.config.node_id,
            self.worker_id,
            shard.len(),
            founders.len()
        );

        let mut summary = WorkerSummary::default();
        for id in shard {
            if self.store.size()? >= target {
                log::info!("Population reached {}, stopping", target);
                break;
            }
            if self.store.is_evaluated(id) {
                summary.skipped += 1;
                continue;
            }
            let recorded = self.evaluate_candidate(evaluator, id, None)?;
            summary.count(&recorded);
        }
        Ok(summary)
    }

    // ========================================================================
    // Tournament evolution
    // ========================================================================

    /// Seed of the first tournament this worker runs in `generation`.
    pub fn tournament_seed(&self, generation: usize) -> u64 {
        let evo = &self.config.evolution;
        let offset = (evo.tournaments_per_gen * evo.num_generations * generation
            + self.worker_id) as u64;
        self.config.rng_seed.wrapping_add(offset.wrapping_mul(100))
    }

    /// Breed and evaluate children until the generation target is reached.
    pub fn run_tournament_evolution(
        &self,
        evaluator: &dyn Evaluator,
        mutator: &mut dyn MutationOperator,
    ) -> Result<WorkerSummary, WorkerError> {
        let generation = self.config.evolution.current_generation;
        let target = self.config.generation_target(generation);
        let min_rank = self.config.min_eligible_rank(generation);
        let retry = self.config.timing.parent_wait();

        let mut seed = self.tournament_seed(generation);
        let mut selector = TournamentSelector::new(self.config.tournament.clone(), seed);
        let mut summary = WorkerSummary::default();

        log::info!(
            "Worker {}/{} starting generation {} (target {}, parents from rank {})",
            self.config.node_id,
            self.worker_id,
            generation,
            target,
            min_rank
        );

        while self.store.size()? < target {
            selector.reseed(seed);
            seed = seed.wrapping_add(1);

            let Some(parent) = selector.select(&self.store, min_rank)? else {
                log::info!("No eligible parent yet, retrying in {:?}", retry);
                thread::sleep(retry);
                continue;
            };

            let child = self.fresh_child_id();
            let recorded = match mutator.mutate(&parent.id, &child, &self.store) {
                Ok(()) => self.evaluate_candidate(evaluator, &child, Some(&parent))?,
                Err(CollaboratorError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    log::warn!("Mutation of {} into {} failed: {}", parent.id, child, e);
                    self.record_failure(&child, &e)?
                }
            };
            summary.count(&recorded);
        }

        log::info!(
            "Worker {}/{} finished generation {}: {:?}",
            self.config.node_id,
            self.worker_id,
            generation,
            summary
        );
        Ok(summary)
    }

    /// A child id no artifact uses yet.
    fn fresh_child_id(&self) -> CandidateId {
        loop {
            let id = CandidateId::stamped(self.config.node_id, self.worker_id);
            if !self.store.exists(&id, ArtifactKind::Definition) && !self.store.is_evaluated(&id) {
                return id;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate one candidate and write its terminal record.
    ///
    /// Evaluator failures become an [`ErrorMetadata`]; a write conflict or
    /// other store failure is returned as fatal.
    pub fn evaluate_candidate(
        &self,
        evaluator: &dyn Evaluator,
        id: &CandidateId,
        parent: Option<&Metadata>,
    ) -> Result<Recorded, WorkerError> {
        let request = EvaluationRequest {
            id: id.clone(),
            definition: self.store.path(id, ArtifactKind::Definition),
            output_dir: self.store.root().to_path_buf(),
            parent: parent.map(|p| p.id.clone()),
        };

        let start = Instant::now();
        match evaluator.evaluate(&request) {
            Ok(outcome) => {
                let train_time = outcome
                    .train_time
                    .unwrap_or_else(|| start.elapsed().as_secs_f64());
                let metadata = match parent {
                    Some(parent) => Metadata::child_of(parent, id.clone(), outcome.reward, train_time),
                    None => Metadata::root(id.clone(), outcome.reward, train_time),
                };
                self.store.write_metadata(&metadata)?;
                log::info!("{} reward {:.4} in {:.1}s", id, outcome.reward, train_time);
                Ok(Recorded::Success(metadata))
            }
            Err(CollaboratorError::Store(e)) => Err(e.into()),
            Err(e) => {
                log::warn!("Evaluation of {} failed: {}", id, e);
                self.record_failure(id, &e)
            }
        }
    }

    fn record_failure(
        &self,
        id: &CandidateId,
        error: &CollaboratorError,
    ) -> Result<Recorded, WorkerError> {
        let record = ErrorMetadata {
            id: id.clone(),
            node_id: self.config.node_id,
            worker_id: Some(self.worker_id),
            message: error.to_string(),
        };
        self.store.write_error_metadata(&record)?;
        Ok(Recorded::Failure(record))
    }

    /// Leave the crash marker the supervisor watches for.
    pub fn write_crash_marker(&self, error: &WorkerError) -> Result<(), StoreError> {
        let pid = std::process::id();
        let path = self
            .store
            .write_crash_marker(self.config.node_id, pid, &error.to_string())?;
        log::error!("Worker {} fatal: {} (marker {})", self.worker_id, error, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::EvaluationOutcome;
    use std::cell::Cell;
    use std::fs;
    use tempfile::tempdir;

    /// Rewards each candidate by its index; fails on odd indices if asked.
    struct IndexEvaluator {
        fail_odd: bool,
        calls: Cell<usize>,
    }

    impl IndexEvaluator {
        fn new(fail_odd: bool) -> Self {
            Self {
                fail_odd,
                calls: Cell::new(0),
            }
        }
    }

    impl Evaluator for IndexEvaluator {
        fn evaluate(
            &self,
            request: &EvaluationRequest,
        ) -> Result<EvaluationOutcome, CollaboratorError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail_odd && request.id.index() % 2 == 1 {
                return Err(CollaboratorError::EvaluationFailed {
                    id: request.id.clone(),
                    reason: "odd".to_string(),
                });
            }
            Ok(EvaluationOutcome {
                reward: request.id.index() as f64,
                train_time: Some(0.5),
            })
        }
    }

    /// Copies the parent's definition into the child's.
    struct CopyMutator;

    impl MutationOperator for CopyMutator {
        fn mutate(
            &mut self,
            parent: &CandidateId,
            child: &CandidateId,
            store: &PopulationStore,
        ) -> Result<(), CollaboratorError> {
            let from = store.path(parent, ArtifactKind::Definition);
            let to = store.path(child, ArtifactKind::Definition);
            fs::copy(&from, &to).map_err(|e| CollaboratorError::InvalidRepresentation {
                id: child.clone(),
                reason: e.to_string(),
            })?;
            Ok(())
        }
    }

    fn config(root: &std::path::Path, init: usize) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.out_dir = root.to_path_buf();
        config.evolution.init_population_size = init;
        config.evolution.num_gpus = 1;
        config.evolution.workers_per_gpu = 1;
        config.evolution.tournaments_per_gen = 3;
        config.timing.parent_wait_secs = 0.01;
        config
    }

    fn seed_definitions(store: &PopulationStore, n: usize) -> Vec<CandidateId> {
        store.ensure_layout().unwrap();
        (0..n)
            .map(|i| {
                let id = CandidateId::new(0, i, "18-10-00-00-000");
                fs::write(store.path(&id, ArtifactKind::Definition), b"<genome/>").unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn test_failure_is_recorded_not_fatal() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 4);
        let worker = Worker::new(&config, 0);
        let ids = seed_definitions(worker.store(), 2);

        let evaluator = IndexEvaluator::new(true);
        let ok = worker.evaluate_candidate(&evaluator, &ids[0], None).unwrap();
        let failed = worker.evaluate_candidate(&evaluator, &ids[1], None).unwrap();

        assert!(ok.is_success());
        assert!(!failed.is_success());
        assert_eq!(worker.store().size().unwrap(), 2);
        let record = worker.store().load_error_metadata(&ids[1]).unwrap();
        assert_eq!(record.worker_id, Some(0));
    }

    #[test]
    fn test_second_evaluation_is_a_write_conflict() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 4);
        let worker = Worker::new(&config, 0);
        let ids = seed_definitions(worker.store(), 1);

        let evaluator = IndexEvaluator::new(false);
        worker.evaluate_candidate(&evaluator, &ids[0], None).unwrap();
        let err = worker.evaluate_candidate(&evaluator, &ids[0], None).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Store(StoreError::WriteConflict { .. })
        ));
    }

    #[test]
    fn test_init_population_covers_founders_and_skips_done() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 6);
        let worker = Worker::new(&config, 0);
        let ids = seed_definitions(worker.store(), 6);

        let evaluator = IndexEvaluator::new(false);
        worker.evaluate_candidate(&evaluator, &ids[2], None).unwrap();

        let summary = worker.run_init_population(&evaluator).unwrap();
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.skipped, 1);
        assert_eq!(worker.store().size().unwrap(), 6);
        for id in &ids {
            assert!(worker.store().is_evaluated(id));
        }
    }

    #[test]
    fn test_init_population_shards_between_workers() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), 5);
        config.evolution.workers_per_gpu = 2;
        let ids = seed_definitions(&PopulationStore::new(dir.path()), 5);

        let evaluator = IndexEvaluator::new(false);
        let second = Worker::new(&config, 1).run_init_population(&evaluator).unwrap();
        assert_eq!(second.succeeded, 2);

        let store = PopulationStore::new(dir.path());
        assert!(!store.is_evaluated(&ids[0]));
        assert!(store.is_evaluated(&ids[3]));
        assert!(store.is_evaluated(&ids[4]));
    }

    #[test]
    fn test_tournament_evolution_reaches_target_with_lineage() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 3);
        let worker = Worker::new(&config, 0);
        let evaluator = IndexEvaluator::new(false);
        for id in seed_definitions(worker.store(), 3) {
            worker.evaluate_candidate(&evaluator, &id, None).unwrap();
        }
        // Children must rank after the founders even on coarse mtimes.
        thread::sleep(Duration::from_millis(50));

        let summary = worker
            .run_tournament_evolution(&evaluator, &mut CopyMutator)
            .unwrap();
        assert_eq!(summary.succeeded + summary.failed, 3);
        assert_eq!(worker.store().size().unwrap(), config.generation_target(0));

        let children: Vec<Metadata> = worker
            .store()
            .successes_from_rank(3)
            .unwrap();
        assert_eq!(children.len(), 3);
        for child in children {
            assert_eq!(child.lineage.len(), 2);
            assert_eq!(child.id.origin_node(), 0);
            assert_eq!(child.id.index(), 0);
        }
    }

    #[test]
    fn test_tournament_seed_spreads_workers() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.rng_seed = 7;
        config.evolution.num_generations = 2;
        assert_eq!(Worker::new(&config, 0).tournament_seed(0), 7);
        assert_eq!(Worker::new(&config, 2).tournament_seed(0), 207);
        assert_eq!(Worker::new(&config, 1).tournament_seed(1), 7 + (6 + 1) * 100);
    }

    #[test]
    fn test_crash_marker_uses_own_pid() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 1);
        let worker = Worker::new(&config, 0);
        let error = WorkerError::Store(StoreError::WriteConflict {
            id: CandidateId::new(0, 0, "t"),
        });
        worker.write_crash_marker(&error).unwrap();
        assert!(worker.store().has_crash_marker(0, std::process::id()));
    }
}
