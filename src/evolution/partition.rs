//! Deterministic work partitioning.
//!
//! Every node and every worker computes its own share of the work from the
//! same ordered input, so no assignment is ever communicated. Applying
//! [`partition`] by node count and then by worker count yields a
//! hierarchical shard that is disjoint from every other process's shard.

/// Split `items` into `count` contiguous slices whose sizes differ by at most one.
///
/// The first `items.len() % count` slices receive the extra element. Order is
/// preserved and the concatenation of the slices equals `items`. A `count` of
/// zero yields no slices.
pub fn partition<T>(items: &[T], count: usize) -> Vec<&[T]> {
    if count == 0 {
        return Vec::new();
    }

    let base = items.len() / count;
    let extra = items.len() % count;

    let mut slices = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let len = base + usize::from(i < extra);
        slices.push(&items[start..start + len]);
        start += len;
    }
    slices
}

/// The `index`-th slice of `partition(items, count)`; empty if out of range.
pub fn slice_for<T>(items: &[T], count: usize, index: usize) -> &[T] {
    partition(items, count).get(index).copied().unwrap_or(&[])
}

/// Shard for one worker: partition by node, then by worker.
pub fn worker_shard<T>(
    items: &[T],
    num_nodes: usize,
    node_id: usize,
    num_workers: usize,
    worker_id: usize,
) -> &[T] {
    slice_for(slice_for(items, num_nodes, node_id), num_workers, worker_id)
}
