//! Interfaces to the pieces of the search the engine does not own.
//!
//! The orchestration engine never looks inside a candidate. Producing,
//! mutating, comparing, and scoring candidates all go through these traits,
//! and concrete implementations are chosen explicitly at startup.

use std::path::PathBuf;

use super::store::{PopulationStore, StoreError};
use crate::schema::CandidateId;

/// Errors reported by an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Evaluation of {id} failed: {reason}")]
    EvaluationFailed { id: CandidateId, reason: String },
    #[error("Invalid candidate representation for {id}: {reason}")]
    InvalidRepresentation { id: CandidateId, reason: String },
}

/// Inputs for one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub id: CandidateId,
    /// Definition artifact of the candidate.
    pub definition: PathBuf,
    /// Where the evaluator may write models and other outputs.
    pub output_dir: PathBuf,
    /// Parent in the tournament phase; `None` for founders.
    pub parent: Option<CandidateId>,
}

/// Result of a successful evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationOutcome {
    pub reward: f64,
    /// Seconds spent evaluating, if the evaluator measured it.
    pub train_time: Option<f64>,
}

/// Scores (trains) one candidate. Slow and allowed to fail per candidate.
pub trait Evaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationOutcome, CollaboratorError>;
}

/// Creates a founder's Definition and InitState artifacts.
pub trait CandidateGenerator: Send + Sync {
    fn generate(&self, id: &CandidateId, store: &PopulationStore) -> Result<(), CollaboratorError>;
}

/// Creates a child's Definition and InitState from its parent's InitState.
pub trait MutationOperator {
    fn mutate(
        &mut self,
        parent: &CandidateId,
        child: &CandidateId,
        store: &PopulationStore,
    ) -> Result<(), CollaboratorError>;
}

/// Judges whether two candidates of one batch are near-duplicates.
pub trait SimilarityPredicate: Sync {
    /// Called once with the whole batch before any comparison.
    fn prepare(
        &mut self,
        _store: &PopulationStore,
        _ids: &[CandidateId],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn similar(&self, a: &CandidateId, b: &CandidateId) -> bool;
}
