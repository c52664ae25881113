//! Evo Fleet - distributed tournament evolution over a shared filesystem.
//!
//! A fleet of nodes cooperates on one population of candidates without any
//! coordinator process: the shared output directory is the only channel.
//! Node 0 generates an oversampled batch, deduplicates it by similarity
//! and publishes a sentinel. Every node then runs worker processes that
//! evaluate the founders and breed children by tournament selection, one
//! generation at a time, until the population reaches each phase's target.
//!
//! # Architecture
//!
//! - `schema`: configuration and on-disk record types
//! - `evolution`: store, partitioning, deduplication, selection,
//!   supervision, worker loops and the orchestrator
//! - `backend`: built-in genome and external-command collaborators
//!
//! # Example
//!
//! ```rust,no_run
//! use evo_fleet::{
//!     backend::{GenomeGenerator, GenomeSimilarity},
//!     evolution::Orchestrator,
//!     schema::FleetConfig,
//! };
//!
//! let config = FleetConfig::load("fleet.json", &["node_id=0".to_string()])?;
//! let generator = GenomeGenerator::new(config.genome.clone(), config.rng_seed);
//! let mut similarity = GenomeSimilarity::new(config.genome.similarity_threshold);
//!
//! let program = std::env::current_exe()?;
//! Orchestrator::new(&config, program).run(&generator, &mut similarity)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod evolution;
pub mod schema;

// Re-export commonly used types
pub use evolution::{Orchestrator, PopulationStore, Worker};
pub use schema::{CandidateId, FleetConfig, Metadata};
