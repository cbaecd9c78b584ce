//! Nearest-reference search over 8-bit feature vectors.
//!
//! Queries are processed in batches. Each batch is padded with zero rows up
//! to the engine alignment, multiplied in distance mode against the
//! transposed reference set, and reduced to one [`ArgMin`] per query. The
//! reference set is padded to the alignment as well; padded columns are
//! excluded from the arg-min, so padding never wins.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::engine::TileEngine;
use crate::error::{dimension_error, setup_error, Result};
use crate::kernel::{SquaredDistance, TileOp, MAX_DISTANCE_LEN};
use crate::matrix::Matrix;
use crate::reduce::{row_argmin, ArgMin};

/// Default number of queries per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Immutable set of `count` feature vectors of `dim` bytes each, stored
/// vector after vector. Clones share the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    data: Arc<[u8]>,
    count: usize,
    dim: usize,
}

impl ReferenceSet {
    pub fn new(data: impl Into<Arc<[u8]>>, count: usize, dim: usize) -> Result<Self> {
        let data = data.into();
        if count == 0 || dim == 0 {
            return Err(dimension_error(format!(
                "reference set needs at least one vector and one byte, got {count}x{dim}"
            )));
        }
        if data.len() != count * dim {
            return Err(dimension_error(format!(
                "{count} vectors of {dim} bytes need {} bytes, got {}",
                count * dim,
                data.len()
            )));
        }
        Ok(ReferenceSet { data, count, dim })
    }

    pub fn from_matrix(vectors: &Matrix<u8>) -> Result<Self> {
        Self::new(vectors.as_slice(), vectors.rows(), vectors.cols())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// Vector `i`.
    pub fn vector(&self, i: usize) -> &[u8] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// The set as a `count x dim` matrix.
    pub fn to_matrix(&self) -> Matrix<u8> {
        Matrix::from_fn(self.count, self.dim, |i, j| self.data[i * self.dim + j])
    }

    /// The set as a `dim x count` matrix, both sides zero-padded to `align`.
    pub fn transposed_padded(&self, align: usize) -> Matrix<u8> {
        self.to_matrix().padded(align, align, 0).transpose()
    }
}

/// A search backend returning the closest reference for every query row.
pub trait Nearest {
    fn nearest(&self, queries: &Matrix<u8>, refs: &ReferenceSet) -> Result<Vec<ArgMin>>;
}

/// Checks that queries and references can be compared.
pub fn check_queries(queries: &Matrix<u8>, refs: &ReferenceSet) -> Result<()> {
    if queries.cols() != refs.dim() {
        return Err(dimension_error(format!(
            "queries have {} bytes, references {}",
            queries.cols(),
            refs.dim()
        )));
    }
    if refs.dim() > MAX_DISTANCE_LEN {
        return Err(dimension_error(format!(
            "feature length {} exceeds the {} accumulator bound {MAX_DISTANCE_LEN}",
            refs.dim(),
            SquaredDistance::NAME
        )));
    }
    Ok(())
}

/// Batched search on any [`TileEngine`].
pub struct EngineSearch<'e, E: TileEngine> {
    engine: &'e E,
    batch_size: usize,
}

impl<'e, E: TileEngine> EngineSearch<'e, E> {
    pub fn new(engine: &'e E, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(setup_error("nearest search", "batch size must be at least 1"));
        }
        Ok(EngineSearch { engine, batch_size })
    }
}

impl<E: TileEngine> Nearest for EngineSearch<'_, E> {
    fn nearest(&self, queries: &Matrix<u8>, refs: &ReferenceSet) -> Result<Vec<ArgMin>> {
        check_queries(queries, refs)?;
        let total = queries.rows();
        if total == 0 {
            return Ok(Vec::new());
        }

        let align = self.engine.alignment();
        let refs_t = refs.transposed_padded(align);
        let queries = queries.padded(1, align, 0);
        let dim = refs_t.rows();
        debug!(
            engine = self.engine.name(),
            queries = total,
            references = refs.count(),
            padded = ?(dim, refs_t.cols()),
            "nearest search"
        );

        let mut results = Vec::with_capacity(total);
        for start in (0..total).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(total);
            let rows = end - start;
            let batch =
                Matrix::new(rows, dim, queries.row_block(start, end).to_vec())?.padded(align, 1, 0);
            let mut dist = Matrix::zeros(batch.rows(), refs_t.cols());
            self.engine
                .multiply::<SquaredDistance>(&batch, &refs_t, &mut dist)?;
            let best = row_argmin(&dist, refs.count())?;
            results.extend_from_slice(&best[..rows]);
            trace!(start, end, "batch done");
        }
        Ok(results)
    }
}

/// Brute-force search without tiling or batching.
pub fn naive_nearest(queries: &Matrix<u8>, refs: &ReferenceSet) -> Result<Vec<ArgMin>> {
    check_queries(queries, refs)?;
    Ok((0..queries.rows())
        .map(|i| {
            let query = queries.row(i);
            (0..refs.count()).fold(ArgMin::SENTINEL, |best, r| {
                let distance = query
                    .iter()
                    .zip(refs.vector(r))
                    .fold(0, |acc, (&a, &b)| SquaredDistance::accumulate(acc, a, b));
                best.better(ArgMin::new(distance, r))
            })
        })
        .collect())
}
