//! Bounded real-valued genome backend.
//!
//! Provides random generation, Gaussian mutation, and a distance-based
//! similarity predicate. The definition artifact is a small XML document
//! and the init state is the genome as JSON.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::evolution::{
    ArtifactKind, CandidateGenerator, CollaboratorError, MutationOperator, PopulationStore,
    SimilarityPredicate, StoreError,
};
use crate::schema::{CandidateId, GenomeConstraints};

/// A fixed-length vector of bounded genes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGenome {
    pub genes: Vec<f32>,
}

impl ParameterGenome {
    /// Mean absolute difference between genes.
    ///
    /// Genomes of different length are infinitely far apart.
    pub fn distance(&self, other: &ParameterGenome) -> f32 {
        if self.genes.len() != other.genes.len() {
            return f32::INFINITY;
        }
        if self.genes.is_empty() {
            return 0.0;
        }
        let total: f32 = self
            .genes
            .iter()
            .zip(&other.genes)
            .map(|(a, b)| (a - b).abs())
            .sum();
        total / self.genes.len() as f32
    }

    /// Definition document for `id`.
    pub fn to_xml(&self, id: &CandidateId) -> String {
        let mut xml = format!("<genome id=\"{}\" dimensions=\"{}\">\n", id, self.genes.len());
        for (i, gene) in self.genes.iter().enumerate() {
            // Writing to a String cannot fail.
            let _ = writeln!(xml, "  <gene index=\"{}\">{}</gene>", i, gene);
        }
        xml.push_str("</genome>\n");
        xml
    }

    /// Read a genome from its init state artifact.
    pub fn load(store: &PopulationStore, id: &CandidateId) -> Result<Self, CollaboratorError> {
        let path = store.path(id, ArtifactKind::InitState);
        let invalid = |reason: String| CollaboratorError::InvalidRepresentation {
            id: id.clone(),
            reason,
        };
        let content = fs::read_to_string(&path)
            .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| invalid(format!("{}: {}", path.display(), e)))
    }

    /// Write both the definition and init state artifacts for `id`.
    pub fn save(&self, store: &PopulationStore, id: &CandidateId) -> Result<(), CollaboratorError> {
        write_artifact(&store.path(id, ArtifactKind::Definition), self.to_xml(id))?;

        let json = serde_json::to_string(self).map_err(|e| {
            CollaboratorError::InvalidRepresentation {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;
        write_artifact(&store.path(id, ArtifactKind::InitState), json)
    }
}

fn write_artifact(path: &Path, content: String) -> Result<(), CollaboratorError> {
    fs::write(path, content).map_err(|source| {
        CollaboratorError::Store(StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    })
}

// ============================================================================
// Random generation and mutation
// ============================================================================

/// Random number generator wrapper for genome operations.
pub struct GenomeRng {
    rng: StdRng,
}

impl GenomeRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate a random genome within constraints.
    pub fn random_genome(&mut self, constraints: &GenomeConstraints) -> ParameterGenome {
        ParameterGenome {
            genes: (0..constraints.dimensions)
                .map(|_| self.uniform(constraints.value_bounds))
                .collect(),
        }
    }

    /// Uniform random in bounds.
    fn uniform(&mut self, bounds: (f32, f32)) -> f32 {
        self.rng.gen_range(bounds.0..=bounds.1)
    }

    /// Gaussian mutation: add noise scaled by the bounds width, then clamp.
    pub fn gaussian_mutate(&mut self, value: f32, strength: f32, bounds: (f32, f32)) -> f32 {
        let noise: f32 = self.rng.sample(rand_distr::StandardNormal);
        let mutated = value + noise * strength * (bounds.1 - bounds.0);
        mutated.clamp(bounds.0, bounds.1)
    }

    /// Mutate each gene with probability `mutation_rate`.
    ///
    /// At least one gene always changes so a child never copies its parent.
    pub fn mutate(&mut self, genome: &mut ParameterGenome, constraints: &GenomeConstraints) {
        let bounds = constraints.value_bounds;
        let strength = constraints.mutation_strength;
        let mut touched = false;
        for gene in &mut genome.genes {
            if self.rng.r#gen::<f32>() < constraints.mutation_rate {
                *gene = self.gaussian_mutate(*gene, strength, bounds);
                touched = true;
            }
        }
        if !touched && !genome.genes.is_empty() {
            let idx = self.rng.gen_range(0..genome.genes.len());
            genome.genes[idx] = self.gaussian_mutate(genome.genes[idx], strength, bounds);
        }
    }
}

// ============================================================================
// Collaborator implementations
// ============================================================================

/// Creates founders with uniformly random genes.
///
/// Each id gets its own RNG stream, so generation is reproducible no matter
/// which thread handles which id.
pub struct GenomeGenerator {
    constraints: GenomeConstraints,
    seed: u64,
}

impl GenomeGenerator {
    pub fn new(constraints: GenomeConstraints, seed: u64) -> Self {
        Self { constraints, seed }
    }
}

impl CandidateGenerator for GenomeGenerator {
    fn generate(&self, id: &CandidateId, store: &PopulationStore) -> Result<(), CollaboratorError> {
        let stream = ((id.origin_node() as u64) << 32) | id.index() as u64;
        let mut rng = GenomeRng::new(self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        rng.random_genome(&self.constraints).save(store, id)
    }
}

/// Derives a child by Gaussian mutation of its parent's genes.
pub struct GenomeMutator {
    constraints: GenomeConstraints,
    rng: GenomeRng,
}

impl GenomeMutator {
    pub fn new(constraints: GenomeConstraints, seed: u64) -> Self {
        Self {
            constraints,
            rng: GenomeRng::new(seed),
        }
    }
}

impl MutationOperator for GenomeMutator {
    fn mutate(
        &mut self,
        parent: &CandidateId,
        child: &CandidateId,
        store: &PopulationStore,
    ) -> Result<(), CollaboratorError> {
        let mut genome = ParameterGenome::load(store, parent)?;
        self.rng.mutate(&mut genome, &self.constraints);
        genome.save(store, child)
    }
}

/// Near-duplicate test on genome distance.
pub struct GenomeSimilarity {
    threshold: f32,
    genomes: HashMap<CandidateId, ParameterGenome>,
}

impl GenomeSimilarity {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            genomes: HashMap::new(),
        }
    }
}

impl SimilarityPredicate for GenomeSimilarity {
    fn prepare(&mut self, store: &PopulationStore, ids: &[CandidateId]) -> Result<(), CollaboratorError> {
        self.genomes.clear();
        for id in ids {
            match ParameterGenome::load(store, id) {
                Ok(genome) => {
                    self.genomes.insert(id.clone(), genome);
                }
                Err(e) => log::warn!("Ignoring {} in similarity check: {}", id, e),
            }
        }
        Ok(())
    }

    /// Unknown ids are never similar to anything.
    fn similar(&self, a: &CandidateId, b: &CandidateId) -> bool {
        match (self.genomes.get(a), self.genomes.get(b)) {
            (Some(ga), Some(gb)) => ga.distance(gb) < self.threshold,
            _ => false,
        }
    }
}
