//! Distributed population search over a shared filesystem.
//!
//! - [`store`]: the population ledger every node reads and writes
//! - [`partition`]: deterministic work splitting across nodes and workers
//! - [`dedup`]: one-shot similarity deduplication of the setup batch
//! - [`selection`]: tournament parent selection over a rank window
//! - [`supervisor`]: worker process launch, crash detection and relaunch
//! - [`worker`]: the init and tournament worker loops
//! - [`orchestrator`]: the per-node phase state machine

pub mod collaborators;
pub mod dedup;
pub mod orchestrator;
pub mod partition;
pub mod selection;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use collaborators::{
    CandidateGenerator, CollaboratorError, EvaluationOutcome, EvaluationRequest, Evaluator,
    MutationOperator, SimilarityPredicate,
};
pub use dedup::{DedupEngine, DedupReport};
pub use orchestrator::{Orchestrator, OrchestratorError, Phase};
pub use partition::{partition, slice_for, worker_shard};
pub use selection::TournamentSelector;
pub use store::{ArtifactKind, PopulationStore, RankedOutcome, SortBy, StoreError};
pub use supervisor::{ProcessSupervisor, SupervisorError, WorkerSpec, WorkerStatus};
pub use worker::{Recorded, Worker, WorkerError, WorkerSummary};
