//! Partitioning of atoms into contiguous worker chunks
//!
//! Chunks are contiguous, ordered and near-equal in size, so concatenating
//! them in worker order reproduces the input exactly.

use std::ops::Range;

use crate::error::{EnsembleError, Result};

/// Index ranges splitting `len` items across at most `workers` chunks
///
/// Produces `min(len, workers)` ranges whose sizes differ by at most one.
/// Chunk `k` covers `[k * len / n, (k + 1) * len / n)` for `n` chunks.
///
/// # Arguments
/// * `len` - Number of items to partition
/// * `workers` - Requested number of workers (must be at least 1)
///
/// # Returns
/// The ranges in worker-launch order, or `InvalidWorkerCount` if `workers` is zero
pub fn chunk_bounds(len: usize, workers: usize) -> Result<Vec<Range<usize>>> {
    if workers == 0 {
        return Err(EnsembleError::InvalidWorkerCount);
    }

    let n_chunks = workers.min(len);
    Ok((0..n_chunks)
        .map(|k| (k * len / n_chunks)..((k + 1) * len / n_chunks))
        .collect())
}

/// Split `items` into owned, contiguous chunks, one per worker
///
/// Each chunk is an independent copy so it can be moved into its worker.
pub fn chunk_it<T: Clone>(items: &[T], workers: usize) -> Result<Vec<Vec<T>>> {
    Ok(chunk_bounds(items.len(), workers)?
        .into_iter()
        .map(|range| items[range].to_vec())
        .collect())
}
