//! Multi-device product on the emulated accelerator.
//!
//! Output rows are split across devices with the shared partition policy.
//! Each device receives its rows of `A` and all of `B`, pads its row block
//! up to the kernel tile, runs one tiled launch and reads back only the rows
//! it owns. All devices are fed before the host waits on any of them.

use std::sync::Arc;

use num::Zero;
use tracing::debug;

use crate::config::GpuKernel;
use crate::engine::{check_aligned, check_shapes, TileEngine};
use crate::error::Result;
use crate::gpu::device::{Context, DeviceBuffer};
use crate::gpu::kernels::{Kernel, Tiled16MatMul, TiledMatMul};
use crate::gpu::queue::{PendingLaunch, PendingRead};
use crate::gpu::workgroup::LaunchStats;
use crate::kernel::TileOp;
use crate::matrix::Matrix;
use crate::partition::Partition;
use crate::utils::round_up;
use crate::TILE;

pub struct GpuEngine {
    context: Context,
    kernel: GpuKernel,
}

impl GpuEngine {
    pub fn new(devices: usize, kernel: GpuKernel) -> Result<Self> {
        Ok(GpuEngine {
            context: Context::new(devices)?,
            kernel,
        })
    }

    pub fn with_context(context: Context, kernel: GpuKernel) -> Self {
        GpuEngine { context, kernel }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn devices(&self) -> usize {
        self.context.len()
    }

    /// Multiplies and returns the launch statistics of every device that
    /// received rows.
    pub fn multiply_with_stats<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<Vec<LaunchStats>> {
        check_shapes::<Op>(a, b, c)?;
        check_aligned(a, b, self.alignment())?;
        let (p, q, r) = (a.rows(), a.cols(), b.cols());
        let tile = self.kernel.tile();
        let partition = self.row_partition(p)?;

        let a_host: Arc<[Op::Elem]> = Arc::from(a.as_slice());
        let b_host: Arc<[Op::Elem]> = Arc::from(b.as_slice());

        let mut in_flight: Vec<(usize, PendingLaunch, PendingRead<Op::Acc>)> = Vec::new();
        for (queue, range) in self.context.queues().iter().zip(partition.ranges()) {
            if range.is_empty() {
                continue;
            }
            let device = queue.device();
            let rows = range.len();
            let padded_rows = round_up(rows, tile);

            let a_buf = device.alloc::<Op::Elem>(padded_rows * q)?;
            let b_buf = device.alloc::<Op::Elem>(q * r)?;
            let c_buf = device.alloc_filled(padded_rows * r, Op::Acc::zero())?;

            let a_written =
                queue.enqueue_write(&a_buf, 0, &a_host, range.start * q..range.end * q, &[])?;
            let b_written = queue.enqueue_write(&b_buf, 0, &b_host, 0..q * r, &[])?;
            let kernel = self.build_kernel::<Op>(a_buf, b_buf, c_buf.clone(), padded_rows, q, r)?;
            let launch = queue.enqueue_kernel(kernel, &[a_written, b_written])?;
            let read = queue.enqueue_read(&c_buf, 0..rows * r, &[launch.event().clone()])?;

            debug!(
                device = device.id(),
                rows = ?range,
                padded_rows,
                kernel = ?self.kernel,
                "device launch queued"
            );
            in_flight.push((range.start, launch, read));
        }

        let mut stats = Vec::with_capacity(in_flight.len());
        for (row_start, launch, read) in in_flight {
            stats.push(launch.wait()?);
            let rows = read.wait()?;
            let dst = row_start * r;
            c.as_mut_slice()[dst..dst + rows.len()].copy_from_slice(&rows);
        }
        Ok(stats)
    }

    fn build_kernel<Op: TileOp>(
        &self,
        a: DeviceBuffer<Op::Elem>,
        b: DeviceBuffer<Op::Elem>,
        c: DeviceBuffer<Op::Acc>,
        rows: usize,
        shared: usize,
        cols: usize,
    ) -> Result<Arc<dyn Kernel>> {
        Ok(match self.kernel {
            GpuKernel::Tile64 => Arc::new(TiledMatMul::<Op>::new(a, b, c, rows, shared, cols)?),
            GpuKernel::Tile16 => Arc::new(Tiled16MatMul::<Op>::new(a, b, c, rows, shared, cols)?),
        })
    }
}

impl TileEngine for GpuEngine {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn alignment(&self) -> usize {
        self.kernel.tile()
    }

    /// Same row tiles as the CPU pool; each device pads its block internally.
    fn row_partition(&self, rows: usize) -> Result<Partition> {
        Partition::rows(rows, TILE, self.context.len())
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        self.multiply_with_stats::<Op>(a, b, c).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BasicEngine;
    use crate::kernel::{Product, SquaredDistance};

    fn create_test_matrix(rows: usize, cols: usize, seed: usize) -> Matrix<f32> {
        Matrix::from_fn(rows, cols, |i, j| ((i * 13 + j * 7 + seed) % 19) as f32 / 19.0 - 0.5)
    }

    #[test]
    fn test_single_device_product() {
        let engine = GpuEngine::new(1, GpuKernel::Tile64).unwrap();
        let a = create_test_matrix(64, 128, 1);
        let b = create_test_matrix(128, 64, 2);
        let mut c = Matrix::zeros(64, 64);
        let mut expected = Matrix::zeros(64, 64);

        let stats = engine.multiply_with_stats::<Product>(&a, &b, &mut c).unwrap();
        BasicEngine.multiply::<Product>(&a, &b, &mut expected).unwrap();

        assert_eq!(c, expected);
        assert_eq!(stats, vec![LaunchStats { groups: 1, barriers_per_group: 4 }]);
    }

    #[test]
    fn test_multi_device_uneven_rows() {
        // 192 rows = 12 row tiles over 5 devices: 3, 3, 2, 2, 2 tiles.
        let engine = GpuEngine::new(5, GpuKernel::Tile64).unwrap();
        let a = create_test_matrix(192, 64, 3);
        let b = create_test_matrix(64, 128, 4);
        let mut c = Matrix::zeros(192, 128);
        let mut expected = Matrix::zeros(192, 128);

        engine.multiply::<Product>(&a, &b, &mut c).unwrap();
        BasicEngine.multiply::<Product>(&a, &b, &mut expected).unwrap();

        assert_eq!(c, expected);
        assert_eq!(
            engine.row_partition(192).unwrap().counts(),
            vec![48, 48, 32, 32, 32]
        );
    }

    #[test]
    fn test_tile16_distance() {
        let engine = GpuEngine::new(2, GpuKernel::Tile16).unwrap();
        let a = Matrix::from_fn(48, 32, |i, j| ((i * 29 + j * 3) % 256) as u8);
        let b = Matrix::from_fn(32, 16, |i, j| ((i * 41 + j * 17) % 256) as u8);
        let mut c = Matrix::zeros(48, 16);
        let mut expected = Matrix::zeros(48, 16);

        engine.multiply::<SquaredDistance>(&a, &b, &mut c).unwrap();
        BasicEngine
            .multiply::<SquaredDistance>(&a, &b, &mut expected)
            .unwrap();
        assert_eq!(c, expected);
    }

    #[test]
    fn test_device_memory_released_after_multiply() {
        let engine = GpuEngine::new(2, GpuKernel::Tile64).unwrap();
        let a = create_test_matrix(64, 64, 5);
        let b = create_test_matrix(64, 64, 6);
        let mut c = Matrix::zeros(64, 64);
        engine.multiply::<Product>(&a, &b, &mut c).unwrap();
        engine.context().finish().unwrap();

        for device in engine.context().devices() {
            assert_eq!(device.allocated_bytes(), 0);
        }
    }

    #[test]
    fn test_rejects_unaligned() {
        let engine = GpuEngine::new(1, GpuKernel::Tile64).unwrap();
        let a = create_test_matrix(32, 64, 0);
        let b = create_test_matrix(64, 64, 0);
        let mut c = Matrix::zeros(32, 64);
        assert!(engine.multiply::<Product>(&a, &b, &mut c).is_err());
    }
}
