//! Device kernels.
//!
//! Each kernel owns handles to the buffers it touches and the scalar
//! arguments of its launch. The host enqueues it on the queue of the device
//! that holds those buffers; the queue validates [`Kernel::range`] and
//! [`Kernel::local_mem_bytes`] against the device before anything runs.

use std::marker::PhantomData;
use std::mem::size_of;

use num::Zero;

use crate::error::{dimension_error, Result};
use crate::gpu::device::DeviceBuffer;
use crate::gpu::workgroup::{dispatch, LaunchStats, NDRange};
use crate::gpu::REDUCTION_WIDTH;
use crate::kernel::TileOp;
use crate::utils::{ensure_multiple, round_up, round_work_size};

/// Output tile edge of [`TiledMatMul`].
pub const TS: usize = 64;
/// Rows of the register block owned by one lane.
pub const RWPT: usize = 4;
/// Columns of the register block owned by one lane.
pub const CWPT: usize = 4;
/// Stride between the rows (and columns) of one lane's register block.
pub const SK: usize = TS / RWPT;

/// Output tile edge of [`Tiled16MatMul`].
pub const TS16: usize = 16;

const TRANSPOSE_TILE: usize = 16;

/// A kernel that can be enqueued on a [`crate::gpu::CommandQueue`].
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch geometry.
    fn range(&self) -> NDRange;

    /// Local memory one work-group allocates, in bytes.
    fn local_mem_bytes(&self) -> usize;

    /// Devices owning the buffers this kernel touches.
    fn buffer_devices(&self) -> Vec<usize>;

    /// Runs every work-group to completion.
    fn execute(&self) -> Result<LaunchStats>;
}

/// Buffers and sizes of a `P x Q` by `Q x R` device product.
struct MatMulArgs<Op: TileOp> {
    a: DeviceBuffer<Op::Elem>,
    b: DeviceBuffer<Op::Elem>,
    c: DeviceBuffer<Op::Acc>,
    rows: usize,
    shared: usize,
    cols: usize,
    _op: PhantomData<fn() -> Op>,
}

impl<Op: TileOp> MatMulArgs<Op> {
    fn new(
        a: DeviceBuffer<Op::Elem>,
        b: DeviceBuffer<Op::Elem>,
        c: DeviceBuffer<Op::Acc>,
        [rows, shared, cols]: [usize; 3],
        tile: usize,
    ) -> Result<Self> {
        ensure_multiple("P", rows, tile)?;
        ensure_multiple("Q", shared, tile)?;
        ensure_multiple("R", cols, tile)?;
        // Host callers check the unpadded length; only the zero padding of
        // the last tile may reach past the bound.
        if shared.saturating_sub(tile) >= Op::MAX_SHARED_DIM {
            return Err(dimension_error(format!(
                "shared dimension {shared} exceeds the {} accumulator bound {} by a tile or more",
                Op::NAME,
                Op::MAX_SHARED_DIM
            )));
        }
        for (name, len, need) in [
            ("A", a.len(), rows * shared),
            ("B", b.len(), shared * cols),
            ("C", c.len(), rows * cols),
        ] {
            if len < need {
                return Err(dimension_error(format!(
                    "buffer {name} holds {len} elements, launch needs {need}"
                )));
            }
        }
        if c.same_allocation(&a) || c.same_allocation(&b) {
            return Err(dimension_error("output buffer aliases an input"));
        }
        Ok(MatMulArgs {
            a,
            b,
            c,
            rows,
            shared,
            cols,
            _op: PhantomData,
        })
    }

    fn buffer_devices(&self) -> Vec<usize> {
        vec![self.a.device_id(), self.b.device_id(), self.c.device_id()]
    }
}

/// 64x64 tiled product. A 16x16 group computes one output tile; every lane
/// owns a 4x4 register block whose rows and columns are [`SK`] apart, so
/// neighbouring lanes touch neighbouring addresses.
///
/// Per step of the shared dimension: stage both tiles, barrier, accumulate,
/// barrier.
pub struct TiledMatMul<Op: TileOp> {
    args: MatMulArgs<Op>,
}

impl<Op: TileOp> TiledMatMul<Op> {
    pub fn new(
        a: DeviceBuffer<Op::Elem>,
        b: DeviceBuffer<Op::Elem>,
        c: DeviceBuffer<Op::Acc>,
        rows: usize,
        shared: usize,
        cols: usize,
    ) -> Result<Self> {
        Ok(TiledMatMul {
            args: MatMulArgs::new(a, b, c, [rows, shared, cols], TS)?,
        })
    }
}

impl<Op: TileOp> Kernel for TiledMatMul<Op> {
    fn name(&self) -> &'static str {
        "tiled_matmul_64"
    }

    fn range(&self) -> NDRange {
        NDRange::new(
            [self.args.rows / RWPT, self.args.cols / CWPT],
            [TS / RWPT, TS / CWPT],
        )
    }

    fn local_mem_bytes(&self) -> usize {
        2 * TS * TS * size_of::<Op::Elem>()
    }

    fn buffer_devices(&self) -> Vec<usize> {
        self.args.buffer_devices()
    }

    fn execute(&self) -> Result<LaunchStats> {
        let MatMulArgs {
            rows,
            shared: q,
            cols: r,
            ..
        } = self.args;
        let a = self.args.a.read()?;
        let b = self.args.b.read()?;
        let mut c = self.args.c.write()?;
        let (a, b) = (a.as_slice(), b.as_slice());
        let views = c[..rows * r].chunks_mut(TS * r).collect::<Vec<_>>();

        dispatch(&self.range(), views, |group, c_rows| {
            let [gy, gx] = group.id();
            let mut asub = vec![Op::Elem::default(); TS * TS];
            let mut bsub = vec![Op::Elem::default(); TS * TS];
            let mut acc = vec![[[Op::Acc::zero(); CWPT]; RWPT]; group.size()];

            for t in 0..q / TS {
                group.phase(|lane| {
                    let [row, col] = lane.local;
                    for rw in 0..RWPT {
                        for cw in 0..CWPT {
                            let (wi, wj) = (SK * rw, SK * cw);
                            asub[(row + wi) * TS + col + wj] =
                                a[(gy * TS + row + wi) * q + t * TS + col + wj];
                            bsub[(row + wi) * TS + col + wj] =
                                b[(t * TS + row + wi) * r + gx * TS + col + wj];
                        }
                    }
                });
                group.barrier();

                group.phase(|lane| {
                    let [row, col] = lane.local;
                    let regs = &mut acc[lane.id];
                    for k in 0..TS {
                        let breg: [Op::Elem; CWPT] =
                            std::array::from_fn(|cw| bsub[k * TS + col + SK * cw]);
                        for (rw, reg_row) in regs.iter_mut().enumerate() {
                            let areg = asub[(row + SK * rw) * TS + k];
                            for (reg, &b_val) in reg_row.iter_mut().zip(&breg) {
                                *reg = Op::accumulate_device(*reg, areg, b_val);
                            }
                        }
                    }
                });
                group.barrier();
            }

            group.phase(|lane| {
                let [row, col] = lane.local;
                for (rw, reg_row) in acc[lane.id].iter().enumerate() {
                    for (cw, &value) in reg_row.iter().enumerate() {
                        c_rows[(row + SK * rw) * r + gx * TS + col + SK * cw] = value;
                    }
                }
            });
        })
    }
}

/// 16x16 tiled product with one output element per lane.
pub struct Tiled16MatMul<Op: TileOp> {
    args: MatMulArgs<Op>,
}

impl<Op: TileOp> Tiled16MatMul<Op> {
    pub fn new(
        a: DeviceBuffer<Op::Elem>,
        b: DeviceBuffer<Op::Elem>,
        c: DeviceBuffer<Op::Acc>,
        rows: usize,
        shared: usize,
        cols: usize,
    ) -> Result<Self> {
        Ok(Tiled16MatMul {
            args: MatMulArgs::new(a, b, c, [rows, shared, cols], TS16)?,
        })
    }
}

impl<Op: TileOp> Kernel for Tiled16MatMul<Op> {
    fn name(&self) -> &'static str {
        "tiled_matmul_16"
    }

    fn range(&self) -> NDRange {
        NDRange::new([self.args.rows, self.args.cols], [TS16, TS16])
    }

    fn local_mem_bytes(&self) -> usize {
        2 * TS16 * TS16 * size_of::<Op::Elem>()
    }

    fn buffer_devices(&self) -> Vec<usize> {
        self.args.buffer_devices()
    }

    fn execute(&self) -> Result<LaunchStats> {
        let MatMulArgs {
            rows,
            shared: q,
            cols: r,
            ..
        } = self.args;
        let a = self.args.a.read()?;
        let b = self.args.b.read()?;
        let mut c = self.args.c.write()?;
        let (a, b) = (a.as_slice(), b.as_slice());
        let views = c[..rows * r].chunks_mut(TS16 * r).collect::<Vec<_>>();

        dispatch(&self.range(), views, |group, c_rows| {
            let [gy, gx] = group.id();
            let mut asub = vec![Op::Elem::default(); TS16 * TS16];
            let mut bsub = vec![Op::Elem::default(); TS16 * TS16];
            let mut acc = vec![Op::Acc::zero(); group.size()];

            for t in 0..q / TS16 {
                group.phase(|lane| {
                    let [row, col] = lane.local;
                    asub[row * TS16 + col] = a[(gy * TS16 + row) * q + t * TS16 + col];
                    bsub[row * TS16 + col] = b[(t * TS16 + row) * r + gx * TS16 + col];
                });
                group.barrier();

                group.phase(|lane| {
                    let [row, col] = lane.local;
                    for k in 0..TS16 {
                        acc[lane.id] = Op::accumulate_device(
                            acc[lane.id],
                            asub[row * TS16 + k],
                            bsub[k * TS16 + col],
                        );
                    }
                });
                group.barrier();
            }

            group.phase(|lane| {
                let [row, col] = lane.local;
                c_rows[row * r + gx * TS16 + col] = acc[lane.id];
            });
        })
    }
}

/// Transposes a `rows x cols` matrix into `cols x rows` through a 16x16 local
/// tile, so both the read and the write side are row-contiguous. Lanes
/// outside the matrix skip their load and store.
pub struct Transpose<T> {
    src: DeviceBuffer<T>,
    dst: DeviceBuffer<T>,
    rows: usize,
    cols: usize,
}

impl<T> Transpose<T>
where
    T: Copy + Default + Send + Sync + 'static,
{
    pub fn new(src: DeviceBuffer<T>, dst: DeviceBuffer<T>, rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(dimension_error(format!("cannot transpose {rows}x{cols}")));
        }
        if src.len() < rows * cols || dst.len() < rows * cols {
            return Err(dimension_error(format!(
                "transpose of {rows}x{cols} needs {} elements, buffers hold {} and {}",
                rows * cols,
                src.len(),
                dst.len()
            )));
        }
        if src.same_allocation(&dst) {
            return Err(dimension_error("transpose cannot run in place"));
        }
        Ok(Transpose {
            src,
            dst,
            rows,
            cols,
        })
    }
}

impl<T> Kernel for Transpose<T>
where
    T: Copy + Default + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "transpose"
    }

    /// One lane per output element: axis 0 runs over output rows.
    fn range(&self) -> NDRange {
        NDRange::new(
            [
                round_up(self.cols, TRANSPOSE_TILE),
                round_up(self.rows, TRANSPOSE_TILE),
            ],
            [TRANSPOSE_TILE, TRANSPOSE_TILE],
        )
    }

    fn local_mem_bytes(&self) -> usize {
        TRANSPOSE_TILE * TRANSPOSE_TILE * size_of::<T>()
    }

    fn buffer_devices(&self) -> Vec<usize> {
        vec![self.src.device_id(), self.dst.device_id()]
    }

    fn execute(&self) -> Result<LaunchStats> {
        let (p, q) = (self.rows, self.cols);
        let src = self.src.read()?;
        let mut dst = self.dst.write()?;
        let src = src.as_slice();
        let views = dst[..p * q].chunks_mut(TRANSPOSE_TILE * p).collect::<Vec<_>>();

        dispatch(&self.range(), views, |group, out| {
            let [gy, gx] = group.id();
            let mut tile = vec![T::default(); TRANSPOSE_TILE * TRANSPOSE_TILE];

            group.phase(|lane| {
                let [ly, lx] = lane.local;
                let (i, j) = (gx * TRANSPOSE_TILE + ly, gy * TRANSPOSE_TILE + lx);
                if i < p && j < q {
                    tile[ly * TRANSPOSE_TILE + lx] = src[i * q + j];
                }
            });
            group.barrier();

            group.phase(|lane| {
                let [ly, lx] = lane.local;
                let (ni, nj) = (gy * TRANSPOSE_TILE + ly, gx * TRANSPOSE_TILE + lx);
                if ni < q && nj < p {
                    out[ly * p + nj] = tile[lx * TRANSPOSE_TILE + ly];
                }
            });
        })
    }
}

/// First level of the arg-min: each 256-lane group reduces a slice of one row
/// of the distance matrix to a single (distance, index) partial.
///
/// Lanes past `valid` columns load the sentinel `(i32::MAX, u32::MAX)`, so
/// padded reference columns never win. Candidates compare by distance, then
/// index, so ties go to the lowest index. Partial `g` of row `i` is written to
/// `i * partials_per_row + g`.
pub struct ArgMinReduction {
    dist: DeviceBuffer<i32>,
    out_dist: DeviceBuffer<i32>,
    out_idx: DeviceBuffer<u32>,
    rows: usize,
    valid: usize,
    stride: usize,
}

impl ArgMinReduction {
    /// Reduces the first `valid` columns of each of `rows` rows of `dist`,
    /// whose rows are `stride` elements apart.
    pub fn new(
        dist: DeviceBuffer<i32>,
        out_dist: DeviceBuffer<i32>,
        out_idx: DeviceBuffer<u32>,
        rows: usize,
        valid: usize,
        stride: usize,
    ) -> Result<Self> {
        if rows == 0 || valid == 0 || valid > stride {
            return Err(dimension_error(format!(
                "cannot reduce {rows} rows of {valid} valid columns with stride {stride}"
            )));
        }
        if u32::try_from(valid).is_err() {
            return Err(dimension_error(format!("{valid} columns exceed the index range")));
        }
        let kernel = ArgMinReduction {
            dist,
            out_dist,
            out_idx,
            rows,
            valid,
            stride,
        };
        let partials = rows * kernel.partials_per_row();
        if kernel.dist.len() < rows * stride
            || kernel.out_dist.len() < partials
            || kernel.out_idx.len() < partials
        {
            return Err(dimension_error(format!(
                "reduction of {rows}x{stride} needs {partials} partial slots"
            )));
        }
        if kernel.out_dist.same_allocation(&kernel.dist) {
            return Err(dimension_error("reduction output aliases its input"));
        }
        Ok(kernel)
    }

    /// Partials produced for each row.
    pub fn partials_per_row(&self) -> usize {
        round_work_size(self.stride, REDUCTION_WIDTH) / REDUCTION_WIDTH
    }
}

impl Kernel for ArgMinReduction {
    fn name(&self) -> &'static str {
        "argmin_reduction"
    }

    fn range(&self) -> NDRange {
        NDRange::new(
            [self.rows, round_work_size(self.stride, REDUCTION_WIDTH)],
            [1, REDUCTION_WIDTH],
        )
    }

    fn local_mem_bytes(&self) -> usize {
        REDUCTION_WIDTH * (size_of::<i32>() + size_of::<u32>())
    }

    fn buffer_devices(&self) -> Vec<usize> {
        vec![
            self.dist.device_id(),
            self.out_dist.device_id(),
            self.out_idx.device_id(),
        ]
    }

    fn execute(&self) -> Result<LaunchStats> {
        let (valid, stride) = (self.valid, self.stride);
        let groups = self.partials_per_row();
        let dist = self.dist.read()?;
        let mut out_dist = self.out_dist.write()?;
        let mut out_idx = self.out_idx.write()?;
        let dist = dist.as_slice();
        let partials = self.rows * groups;
        let views = out_dist[..partials]
            .chunks_mut(groups)
            .zip(out_idx[..partials].chunks_mut(groups))
            .collect::<Vec<_>>();

        dispatch(&self.range(), views, |group, (row_dist, row_idx)| {
            let [i, gx] = group.id();
            let width = group.size();
            let mut l_dist = vec![i32::MAX; width];
            let mut l_idx = vec![u32::MAX; width];

            group.phase(|lane| {
                let j = lane.global[1];
                if j < valid {
                    l_dist[lane.id] = dist[i * stride + j];
                    l_idx[lane.id] = j as u32;
                }
            });
            group.barrier();

            let mut p = width / 2;
            while p >= 1 {
                group.phase(|lane| {
                    let lj = lane.id;
                    if lj < p && (l_dist[lj + p], l_idx[lj + p]) < (l_dist[lj], l_idx[lj]) {
                        l_dist[lj] = l_dist[lj + p];
                        l_idx[lj] = l_idx[lj + p];
                    }
                });
                group.barrier();
                p /= 2;
            }

            group.phase(|lane| {
                if lane.id == 0 {
                    row_dist[gx] = l_dist[0];
                    row_idx[gx] = l_idx[0];
                }
            });
        })
    }
}
