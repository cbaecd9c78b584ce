//! Shared-memory thread pool backend.
//!
//! Each worker of a fixed-size rayon pool receives a contiguous range of row
//! tiles from [`Partition::rows`] and writes only its own slice of `C`, so no
//! locking is needed: the operands are shared read-only and the output slices
//! are disjoint by construction. The caller blocks until every worker has
//! finished (`scope` joins all spawned tasks).

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::config::CpuKernel;
use crate::engine::basic::basic_rows;
use crate::engine::tiled::tile_rows;
use crate::engine::{check_aligned, check_shapes, TileEngine};
use crate::error::{setup_error, Result};
use crate::kernel::TileOp;
use crate::matrix::Matrix;
use crate::partition::Partition;

/// Blocked engine spread over a fixed rayon pool, one row range per worker.
///
/// Each worker runs either the tiled or the basic row kernel, picked by
/// [`CpuKernel`]. The pool lives as long as the engine.
pub struct ThreadedEngine {
    pool: ThreadPool,
    workers: usize,
    tile: usize,
    kernel: CpuKernel,
}

impl ThreadedEngine {
    /// Builds a pool of exactly `workers` threads.
    pub fn new(workers: usize, tile: usize, kernel: CpuKernel) -> Result<Self> {
        if workers == 0 {
            return Err(setup_error("thread pool", "worker count must be at least 1"));
        }
        if tile == 0 {
            return Err(setup_error("thread pool", "tile size must be non-zero"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tile-worker-{i}"))
            .build()
            .map_err(|e| setup_error("thread pool", e.to_string()))?;
        Ok(ThreadedEngine {
            pool,
            workers,
            tile,
            kernel,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl TileEngine for ThreadedEngine {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn alignment(&self) -> usize {
        self.tile
    }

    fn row_partition(&self, rows: usize) -> Result<Partition> {
        Partition::rows(rows, self.tile, self.workers)
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        check_shapes::<Op>(a, b, c)?;
        check_aligned(a, b, self.tile)?;
        let (p, q, r) = (a.rows(), a.cols(), b.cols());

        let partition = self.row_partition(p)?;
        debug!(
            mode = Op::NAME,
            workers = self.workers,
            rows = ?partition.counts(),
            "thread pool multiply"
        );
        let parts = partition.scaled(r).split_mut(c.as_mut_slice())?;
        let (a, b) = (a.as_slice(), b.as_slice());
        let (tile, kernel) = (self.tile, self.kernel);

        self.pool.scope(|s| {
            for (range, c_part) in partition.ranges().iter().zip(parts) {
                if range.is_empty() {
                    continue;
                }
                let row_start = range.start;
                s.spawn(move |_| match kernel {
                    CpuKernel::Tiled => tile_rows::<Op>(a, b, c_part, row_start, q, r, tile),
                    CpuKernel::Basic => basic_rows::<Op>(a, b, c_part, row_start, q, r),
                });
            }
        });
        Ok(())
    }
}
