//! One-shot deduplication of the oversampled setup batch.
//!
//! The leader generates many more candidates than the population needs,
//! clusters them by similarity, keeps one representative per cluster, and
//! then pads or trims so that exactly the target number survive. Artifacts
//! of every other candidate are deleted before any worker starts, and a
//! sentinel records that the phase is over.

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{NodeIndex, UnGraph};
use rand::prelude::*;
use rayon::prelude::*;

use super::collaborators::{CollaboratorError, SimilarityPredicate};
use super::store::{ArtifactKind, PopulationStore};
use crate::schema::CandidateId;

/// Categories deleted for candidates that do not survive deduplication.
pub const PRUNED_ARTIFACTS: [ArtifactKind; 3] = [
    ArtifactKind::Definition,
    ArtifactKind::InitState,
    ArtifactKind::Image,
];

/// Outcome of a deduplication pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupReport {
    /// Candidates that keep their artifacts, sorted.
    pub kept: Vec<CandidateId>,
    /// Candidates whose artifacts were deleted, sorted.
    pub removed: Vec<CandidateId>,
    /// Number of similarity clusters.
    pub components: usize,
    /// Duplicates kept to make up for too few clusters.
    pub padded: usize,
    /// How far the kept set fell short of the target.
    pub shortfall: usize,
    /// The sentinel was already present and nothing was done.
    pub skipped: bool,
}

impl DedupReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Survivor selection without side effects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Survivors {
    pub kept: Vec<CandidateId>,
    pub removed: Vec<CandidateId>,
    pub padded: usize,
    pub shortfall: usize,
}

/// Deduplicates one batch against a [`PopulationStore`].
pub struct DedupEngine<'a> {
    store: &'a PopulationStore,
    target_size: usize,
    rng: StdRng,
}

impl<'a> DedupEngine<'a> {
    /// Create an engine that keeps `target_size` candidates.
    pub fn new(store: &'a PopulationStore, target_size: usize, seed: u64) -> Self {
        Self {
            store,
            target_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Deduplicate `ids`, delete the losers' artifacts, and write the sentinel.
    ///
    /// A no-op if the sentinel already exists.
    pub fn run(
        &mut self,
        ids: &[CandidateId],
        predicate: &mut dyn SimilarityPredicate,
    ) -> Result<DedupReport, CollaboratorError> {
        if self.store.setup_done() {
            log::info!("Setup sentinel present, skipping deduplication");
            return Ok(DedupReport::skipped());
        }

        predicate.prepare(self.store, ids)?;
        let components = similarity_components(ids, &*predicate);
        let component_count = components.len();
        log::info!(
            "{} candidates form {} similarity clusters (target {})",
            ids.len(),
            component_count,
            self.target_size
        );

        let survivors = select_survivors(components, self.target_size, &mut self.rng);
        if survivors.shortfall > 0 {
            log::warn!(
                "Only {} distinct-or-padded candidates available, {} short of target {}",
                survivors.kept.len(),
                survivors.shortfall,
                self.target_size
            );
        }

        for id in &survivors.removed {
            for kind in PRUNED_ARTIFACTS {
                self.store.remove(id, kind)?;
            }
        }

        self.store.mark_setup_done()?;

        Ok(DedupReport {
            kept: survivors.kept,
            removed: survivors.removed,
            components: component_count,
            padded: survivors.padded,
            shortfall: survivors.shortfall,
            skipped: false,
        })
    }
}

/// Connected components of the similarity graph over `ids`.
///
/// Pairwise comparisons run in parallel. Each component is sorted so that
/// its representative comes first, and components are ordered by
/// representative.
pub fn similarity_components(
    ids: &[CandidateId],
    predicate: &dyn SimilarityPredicate,
) -> Vec<Vec<CandidateId>> {
    let mut graph: UnGraph<usize, ()> = UnGraph::with_capacity(ids.len(), ids.len());
    let nodes: Vec<NodeIndex> = (0..ids.len()).map(|i| graph.add_node(i)).collect();

    let edges: Vec<(usize, usize)> = (0..ids.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            ((i + 1)..ids.len())
                .filter(move |&j| predicate.similar(&ids[i], &ids[j]))
                .map(move |j| (i, j))
        })
        .collect();
    for (i, j) in edges {
        graph.add_edge(nodes[i], nodes[j], ());
    }

    let mut components: Vec<Vec<CandidateId>> = kosaraju_scc(&graph)
        .into_iter()
        .map(|members| {
            let mut component: Vec<CandidateId> =
                members.into_iter().map(|n| ids[graph[n]].clone()).collect();
            component.sort_by(CandidateId::creation_cmp);
            component
        })
        .collect();
    components.sort_by(|a, b| a[0].creation_cmp(&b[0]));
    components
}

/// Choose exactly `target_size` survivors from clustered candidates.
///
/// One representative per cluster is kept. With too few clusters, random
/// duplicates are kept as padding; if there are not enough duplicates the
/// result is short and `shortfall` says by how much. With too many clusters,
/// random representatives are dropped.
pub fn select_survivors<R: Rng + ?Sized>(
    components: Vec<Vec<CandidateId>>,
    target_size: usize,
    rng: &mut R,
) -> Survivors {
    let mut kept = Vec::with_capacity(components.len());
    let mut duplicates = Vec::new();
    for component in components {
        let mut members = component.into_iter();
        if let Some(representative) = members.next() {
            kept.push(representative);
            duplicates.extend(members);
        }
    }

    let mut padded = 0;
    let mut shortfall = 0;
    if target_size > kept.len() {
        let deficit = target_size - kept.len();
        duplicates.shuffle(rng);
        padded = deficit.min(duplicates.len());
        shortfall = deficit - padded;
        kept.extend(duplicates.drain(..padded));
    } else {
        kept.shuffle(rng);
        duplicates.extend(kept.split_off(target_size));
    }

    kept.sort();
    duplicates.sort();
    Survivors {
        kept,
        removed: duplicates,
        padded,
        shortfall,
    }
}
