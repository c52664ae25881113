//! Benchmarks for similarity clustering of the setup batch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use evo_fleet::evolution::{SimilarityPredicate, dedup::similarity_components};
use evo_fleet::schema::CandidateId;

/// Buckets of `width` consecutive indices are duplicates.
struct Buckets(usize);

impl SimilarityPredicate for Buckets {
    fn similar(&self, a: &CandidateId, b: &CandidateId) -> bool {
        a.index() / self.0 == b.index() / self.0
    }
}

fn bench_similarity_components(c: &mut Criterion) {
    let mut group = c.benchmark_group("similarity_components");

    for size in [100, 500, 1000, 2000] {
        let ids: Vec<CandidateId> = (0..size)
            .map(|i| CandidateId::new(0, i, "18-10-00-00-000"))
            .collect();
        let predicate = Buckets(10);

        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            b.iter(|| similarity_components(black_box(ids), &predicate));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_similarity_components);
criterion_main!(benches);
