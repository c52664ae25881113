//! Built-in collaborator implementations.
//!
//! - `genome`: bounded parameter vectors with Gaussian mutation
//! - `command`: evaluation through an external program

mod command;
mod genome;

pub use command::CommandEvaluator;
pub use genome::{GenomeGenerator, GenomeMutator, GenomeRng, GenomeSimilarity, ParameterGenome};
