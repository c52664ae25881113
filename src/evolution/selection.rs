//! Tournament parent selection over the shared population.

use std::thread;
use std::time::Duration;

use rand::prelude::*;

use super::store::{PopulationStore, StoreError};
use crate::schema::{Metadata, TournamentConfig};

/// Picks parents by best-of-random-sample over an eligibility window.
pub struct TournamentSelector {
    config: TournamentConfig,
    rng: StdRng,
}

impl TournamentSelector {
    /// Create a selector from seed.
    pub fn new(config: TournamentConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reseed the internal RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Select a parent among successes ranked at or above `min_rank`.
    ///
    /// Returns `None` while the eligible pool is empty; the pool only grows as
    /// evaluations complete, so callers retry later.
    pub fn select(
        &mut self,
        store: &PopulationStore,
        min_rank: usize,
    ) -> Result<Option<Metadata>, StoreError> {
        let pool = store.successes_from_rank(min_rank)?;
        Ok(self.select_from(&pool).cloned())
    }

    /// Like [`select`](Self::select), but sleeps `retry` between attempts
    /// until a parent becomes eligible.
    pub fn select_blocking(
        &mut self,
        store: &PopulationStore,
        min_rank: usize,
        retry: Duration,
    ) -> Result<Metadata, StoreError> {
        loop {
            if let Some(parent) = self.select(store, min_rank)? {
                return Ok(parent);
            }
            log::info!(
                "No eligible parent at rank >= {}, retrying in {:?}",
                min_rank,
                retry
            );
            thread::sleep(retry);
        }
    }

    /// Run one tournament over an explicit pool.
    pub fn select_from<'p>(&mut self, pool: &'p [Metadata]) -> Option<&'p Metadata> {
        if pool.is_empty() {
            return None;
        }

        let size = self.config.size.max(1);
        let contenders: Vec<&Metadata> = if self.config.with_replacement {
            (0..size)
                .filter_map(|_| pool.choose(&mut self.rng))
                .collect()
        } else {
            pool.choose_multiple(&mut self.rng, size.min(pool.len()))
                .collect()
        };

        contenders.into_iter().max_by(|a, b| {
            a.reward
                .partial_cmp(&b.reward)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CandidateId, ErrorMetadata};
    use tempfile::tempdir;

    fn id(index: usize) -> CandidateId {
        CandidateId::new(0, index, "18-10-00-00-000")
    }

    fn config(size: usize, with_replacement: bool) -> TournamentConfig {
        TournamentConfig {
            size,
            with_replacement,
        }
    }

    #[test]
    fn test_empty_pool_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        let mut selector = TournamentSelector::new(config(3, false), 1);
        assert!(selector.select(&store, 0).unwrap().is_none());
    }

    #[test]
    fn test_full_sample_returns_best() {
        let pool: Vec<Metadata> = [3.0, 11.0, 7.0]
            .iter()
            .enumerate()
            .map(|(i, r)| Metadata::root(id(i), *r, 1.0))
            .collect();
        let mut selector = TournamentSelector::new(config(10, false), 5);
        for _ in 0..20 {
            assert_eq!(selector.select_from(&pool).unwrap().reward, 11.0);
        }
    }

    #[test]
    fn test_with_replacement_draws_from_pool() {
        let pool: Vec<Metadata> = (0..5).map(|i| Metadata::root(id(i), i as f64, 1.0)).collect();
        let mut selector = TournamentSelector::new(config(2, true), 9);
        for _ in 0..50 {
            let winner = selector.select_from(&pool).unwrap();
            assert!(pool.iter().any(|m| m.id == winner.id));
        }
    }

    #[test]
    fn test_window_excludes_errors_and_old_ranks() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());

        // rank 0: strong but outside the window
        store.write_metadata(&Metadata::root(id(0), 100.0, 1.0)).unwrap();
        // rank 1: failure inside the window
        store
            .write_error_metadata(&ErrorMetadata {
                id: id(1),
                node_id: 0,
                worker_id: None,
                message: "diverged".to_string(),
            })
            .unwrap();
        // rank 2 and 3: eligible
        store.write_metadata(&Metadata::root(id(2), 4.0, 1.0)).unwrap();
        store.write_metadata(&Metadata::root(id(3), 2.0, 1.0)).unwrap();

        let mut selector = TournamentSelector::new(config(1, true), 3);
        for _ in 0..30 {
            let parent = selector.select(&store, 1).unwrap().unwrap();
            assert!(parent.id == id(2) || parent.id == id(3));
        }

        assert!(selector.select(&store, 4).unwrap().is_none());
    }
}
