//! Nearest search on the emulated devices.
//!
//! Every device receives the whole reference set once and transposes it in
//! device memory. Queries are then consumed in rounds of `batch_size` per
//! device: each round is split across the devices with the shared partition
//! policy, and every device runs
//!
//! ```text
//! write batch -> distance kernel -> arg-min reduction -> read partials (x2)
//! ```
//!
//! with each step waiting on the event of the step before it. The distance
//! and index partials are two separate non-blocking reads; the host waits on
//! both before merging them.

use std::sync::Arc;

use tracing::debug;

use crate::error::{setup_error, Result};
use crate::gpu::device::{Context, DeviceBuffer};
use crate::gpu::kernels::{ArgMinReduction, TiledMatMul, Transpose, TS};
use crate::gpu::queue::{Event, PendingRead};
use crate::gpu::REDUCTION_WIDTH;
use crate::kernel::SquaredDistance;
use crate::matrix::Matrix;
use crate::nearest::{check_queries, Nearest, ReferenceSet};
use crate::partition::Partition;
use crate::reduce::{merge_partials, ArgMin};
use crate::utils::{round_up, round_work_size};

pub struct GpuNearest {
    context: Context,
    batch_size: usize,
}

/// Transposed reference set resident on one device.
struct ResidentRefs {
    transposed: DeviceBuffer<u8>,
    ready: Event,
}

impl GpuNearest {
    pub fn new(devices: usize, batch_size: usize) -> Result<Self> {
        Self::with_context(Context::new(devices)?, batch_size)
    }

    pub fn with_context(context: Context, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(setup_error("nearest search", "batch size must be at least 1"));
        }
        Ok(GpuNearest {
            context,
            batch_size,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Uploads the padded `count x dim` reference matrix to every device and
    /// queues its transposition to `dim x count`.
    fn upload_refs(&self, refs: &ReferenceSet) -> Result<Vec<ResidentRefs>> {
        let padded = refs.to_matrix().padded(TS, TS, 0);
        let (count, dim) = (padded.rows(), padded.cols());
        let host: Arc<[u8]> = padded.into_vec().into();

        self.context
            .queues()
            .iter()
            .map(|queue| {
                let device = queue.device();
                let raw = device.alloc::<u8>(count * dim)?;
                let transposed = device.alloc::<u8>(dim * count)?;
                let written = queue.enqueue_write(&raw, 0, &host, 0..host.len(), &[])?;
                let kernel = Transpose::new(raw, transposed.clone(), count, dim)?;
                let launch = queue.enqueue_kernel(Arc::new(kernel), &[written])?;
                Ok(ResidentRefs {
                    transposed,
                    ready: launch.event().clone(),
                })
            })
            .collect()
    }
}

impl Nearest for GpuNearest {
    fn nearest(&self, queries: &Matrix<u8>, refs: &ReferenceSet) -> Result<Vec<ArgMin>> {
        check_queries(queries, refs)?;
        let total = queries.rows();
        if total == 0 {
            return Ok(Vec::new());
        }

        let count = refs.count();
        let (count_p, dim_p) = (round_up(count, TS), round_up(refs.dim(), TS));
        let partials = round_work_size(count_p, REDUCTION_WIDTH) / REDUCTION_WIDTH;
        let resident = self.upload_refs(refs)?;
        let host: Arc<[u8]> = queries.padded(1, TS, 0).into_vec().into();

        let devices = self.context.len();
        let round = self.batch_size * devices;
        let mut results = Vec::with_capacity(total);

        for start in (0..total).step_by(round) {
            let n = round.min(total - start);
            let partition = Partition::even(n, devices)?;
            debug!(start, queries = n, split = ?partition.counts(), "search round");

            let mut in_flight: Vec<(PendingRead<i32>, PendingRead<u32>)> = Vec::new();
            for ((queue, refs_t), range) in self
                .context
                .queues()
                .iter()
                .zip(&resident)
                .zip(partition.ranges())
            {
                if range.is_empty() {
                    continue;
                }
                let device = queue.device();
                let rows = range.len();
                let rows_p = round_up(rows, TS);

                let batch = device.alloc::<u8>(rows_p * dim_p)?;
                let dist = device.alloc::<i32>(rows_p * count_p)?;
                let out_dist = device.alloc::<i32>(rows * partials)?;
                let out_idx = device.alloc::<u32>(rows * partials)?;

                let first = start + range.start;
                let written = queue.enqueue_write(
                    &batch,
                    0,
                    &host,
                    first * dim_p..(first + rows) * dim_p,
                    &[],
                )?;
                let conv = TiledMatMul::<SquaredDistance>::new(
                    batch,
                    refs_t.transposed.clone(),
                    dist.clone(),
                    rows_p,
                    dim_p,
                    count_p,
                )?;
                let conv = queue.enqueue_kernel(Arc::new(conv), &[written, refs_t.ready.clone()])?;
                let reduce = ArgMinReduction::new(
                    dist,
                    out_dist.clone(),
                    out_idx.clone(),
                    rows,
                    count,
                    count_p,
                )?;
                let reduce = queue.enqueue_kernel(Arc::new(reduce), &[conv.event().clone()])?;

                let reduced = [reduce.event().clone()];
                let read_dist = queue.enqueue_read(&out_dist, 0..rows * partials, &reduced)?;
                let read_idx = queue.enqueue_read(&out_idx, 0..rows * partials, &reduced)?;
                in_flight.push((read_dist, read_idx));
            }

            for (read_dist, read_idx) in in_flight {
                let dist = read_dist.wait()?;
                let idx = read_idx.wait()?;
                results.extend(merge_partials(&dist, &idx, partials)?);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nearest::naive_nearest;

    #[test]
    fn test_matches_naive_across_devices() {
        let refs_data: Vec<u8> = (0..300 * 24).map(|x| ((x * 131 + 7) % 251) as u8).collect();
        let refs = ReferenceSet::new(refs_data, 300, 24).unwrap();
        let queries = Matrix::from_fn(150, 24, |i, j| ((i * 61 + j * 29) % 256) as u8);

        let search = GpuNearest::new(3, 16).unwrap();
        let found = search.nearest(&queries, &refs).unwrap();
        assert_eq!(found, naive_nearest(&queries, &refs).unwrap());
    }

    #[test]
    fn test_device_memory_released() {
        let refs = ReferenceSet::new(vec![3u8; 10 * 4], 10, 4).unwrap();
        let queries = Matrix::filled(5, 4, 3u8);
        let search = GpuNearest::new(2, 2).unwrap();
        let found = search.nearest(&queries, &refs).unwrap();
        assert!(found.iter().all(|m| *m == ArgMin::new(0, 0)));

        search.context().finish().unwrap();
        for device in search.context().devices() {
            assert_eq!(device.allocated_bytes(), 0);
        }
    }

    #[test]
    fn test_zero_batch_rejected() {
        assert!(GpuNearest::new(1, 0).is_err());
        assert!(GpuNearest::new(0, 8).is_err());
    }
}
