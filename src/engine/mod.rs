//! The tile engine contract and its CPU backends.
//!
//! Every backend computes `C = A (x) B` for `A: P x Q`, `B: Q x R`,
//! `C: P x R`, where `(x)` is fixed by a [`TileOp`]: the ordinary matrix
//! product for [`crate::kernel::Product`] or the squared-difference sum for
//! [`crate::kernel::SquaredDistance`]. The output is allocated by the caller
//! and fully overwritten.
//!
//! Backends reject operands that are not aligned to their tile size before
//! touching any data; [`multiply_padded`] pads on the caller side instead.

pub mod basic;
pub mod tiled;
pub mod threads;

pub use basic::BasicEngine;
pub use threads::ThreadedEngine;
pub use tiled::TiledEngine;

use num::Zero;
use tracing::debug;

use crate::config::{Backend, Config};
use crate::error::{dimension_error, Result};
use crate::gpu::GpuEngine;
use crate::kernel::TileOp;
use crate::matrix::Matrix;
use crate::partition::Partition;
use crate::utils::ensure_multiple;

/// A backend implementing the blocked multiply contract.
pub trait TileEngine {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Edge every operand dimension must be a multiple of.
    fn alignment(&self) -> usize;

    /// Assignment of output rows to this backend's workers.
    fn row_partition(&self, rows: usize) -> Result<Partition> {
        Partition::even(rows, 1)
    }

    /// Computes `c = a (x) b`, overwriting `c`.
    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()>;
}

/// Checks that `a`, `b` and `c` describe a `P x Q`, `Q x R`, `P x R` product
/// that `Op` can accumulate without overflow.
///
/// Only steps of the shared dimension that are non-zero on at least one side
/// count against [`TileOp::MAX_SHARED_DIM`], so operands zero-padded past the
/// bound are accepted as long as their real length is within it.
pub fn check_shapes<Op: TileOp>(
    a: &Matrix<Op::Elem>,
    b: &Matrix<Op::Elem>,
    c: &Matrix<Op::Acc>,
) -> Result<()> {
    let (p, q, r) = (a.rows(), a.cols(), b.cols());
    if p == 0 || q == 0 || r == 0 {
        return Err(dimension_error(format!("empty operand: P={p}, Q={q}, R={r}")));
    }
    if b.rows() != q {
        return Err(dimension_error(format!(
            "A is {p}x{q} but B has {} rows",
            b.rows()
        )));
    }
    if c.rows() != p || c.cols() != r {
        return Err(dimension_error(format!(
            "C must be {p}x{r}, got {}x{}",
            c.rows(),
            c.cols()
        )));
    }
    if q > Op::MAX_SHARED_DIM {
        let live = live_shared_len(a, b);
        if live > Op::MAX_SHARED_DIM {
            return Err(dimension_error(format!(
                "shared dimension {q} ({live} non-zero) exceeds the {} accumulator bound {}",
                Op::NAME,
                Op::MAX_SHARED_DIM
            )));
        }
    }
    Ok(())
}

/// Steps `k` of the shared dimension where column `k` of `a` or row `k` of
/// `b` holds a non-default element. A step that is zero on both sides adds
/// nothing in either mode.
fn live_shared_len<T: Copy + Default + PartialEq>(a: &Matrix<T>, b: &Matrix<T>) -> usize {
    let zero = T::default();
    let mut live = vec![false; a.cols()];
    for i in 0..a.rows() {
        for (k, &x) in a.row(i).iter().enumerate() {
            live[k] |= x != zero;
        }
    }
    for (k, flag) in live.iter_mut().enumerate() {
        *flag = *flag || b.row(k).iter().any(|&x| x != zero);
    }
    live.into_iter().filter(|&l| l).count()
}

/// Checks that `P`, `Q` and `R` are all multiples of `tile`.
pub fn check_aligned<T: Copy>(a: &Matrix<T>, b: &Matrix<T>, tile: usize) -> Result<()> {
    ensure_multiple("P", a.rows(), tile)?;
    ensure_multiple("Q", a.cols(), tile)?;
    ensure_multiple("R", b.cols(), tile)
}

/// Pads `a` and `b` with `Elem::default()` up to the engine alignment,
/// multiplies, and crops the result back to `a.rows() x b.cols()`.
///
/// Zero padding along the shared dimension adds nothing in either mode; padded
/// output rows and columns are cut off before returning.
pub fn multiply_padded<E, Op>(
    engine: &E,
    a: &Matrix<Op::Elem>,
    b: &Matrix<Op::Elem>,
) -> Result<Matrix<Op::Acc>>
where
    E: TileEngine,
    Op: TileOp,
{
    let tile = engine.alignment();
    let a_padded = a.padded(tile, tile, Op::Elem::default());
    let b_padded = b.padded(tile, tile, Op::Elem::default());
    let mut c = Matrix::filled(a_padded.rows(), b_padded.cols(), Op::Acc::zero());
    engine.multiply::<Op>(&a_padded, &b_padded, &mut c)?;
    c.cropped(a.rows(), b.cols())
}

/// Config-selected backend.
pub enum Engine {
    Basic(BasicEngine),
    Tiled(TiledEngine),
    Threads(ThreadedEngine),
    Gpu(GpuEngine),
}

impl Engine {
    /// Builds the backend named by `config.backend`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let engine = match config.backend {
            Backend::Basic => Engine::Basic(BasicEngine),
            Backend::Tiled => Engine::Tiled(TiledEngine::new(config.tile)?),
            Backend::Threads => Engine::Threads(ThreadedEngine::new(
                config.threads,
                config.tile,
                config.cpu_kernel,
            )?),
            Backend::Gpu => Engine::Gpu(GpuEngine::new(config.devices, config.gpu_kernel)?),
        };
        debug!(backend = engine.name(), "engine ready");
        Ok(engine)
    }
}

impl TileEngine for Engine {
    fn name(&self) -> &'static str {
        match self {
            Engine::Basic(e) => e.name(),
            Engine::Tiled(e) => e.name(),
            Engine::Threads(e) => e.name(),
            Engine::Gpu(e) => e.name(),
        }
    }

    fn alignment(&self) -> usize {
        match self {
            Engine::Basic(e) => e.alignment(),
            Engine::Tiled(e) => e.alignment(),
            Engine::Threads(e) => e.alignment(),
            Engine::Gpu(e) => e.alignment(),
        }
    }

    fn row_partition(&self, rows: usize) -> Result<Partition> {
        match self {
            Engine::Basic(e) => e.row_partition(rows),
            Engine::Tiled(e) => e.row_partition(rows),
            Engine::Threads(e) => e.row_partition(rows),
            Engine::Gpu(e) => e.row_partition(rows),
        }
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        match self {
            Engine::Basic(e) => e.multiply::<Op>(a, b, c),
            Engine::Tiled(e) => e.multiply::<Op>(a, b, c),
            Engine::Threads(e) => e.multiply::<Op>(a, b, c),
            Engine::Gpu(e) => e.multiply::<Op>(a, b, c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Product, SquaredDistance};

    #[test]
    fn test_check_shapes_rejects_mismatch() {
        let a = Matrix::<f32>::zeros(4, 3);
        let b = Matrix::<f32>::zeros(4, 5);
        let c = Matrix::<f32>::zeros(4, 5);
        assert!(check_shapes::<Product>(&a, &b, &c).is_err());

        let b = Matrix::<f32>::zeros(3, 5);
        assert!(check_shapes::<Product>(&a, &b, &c).is_ok());
        let c_bad = Matrix::<f32>::zeros(5, 4);
        assert!(check_shapes::<Product>(&a, &b, &c_bad).is_err());
    }

    #[test]
    fn test_check_shapes_rejects_overflowing_distance() {
        let q = crate::kernel::MAX_DISTANCE_LEN + 1;
        let a = Matrix::<u8>::filled(1, q, 255);
        let b = Matrix::<u8>::zeros(q, 1);
        let c = Matrix::<i32>::zeros(1, 1);
        assert!(check_shapes::<SquaredDistance>(&a, &b, &c).is_err());
    }

    #[test]
    fn test_check_shapes_accepts_zero_padding_past_distance_bound() {
        let len = crate::kernel::MAX_DISTANCE_LEN;
        let a = Matrix::<u8>::filled(1, len, 255).padded(1, 16, 0);
        let b = Matrix::<u8>::zeros(len, 1).padded(16, 1, 0);
        let c = Matrix::<i32>::zeros(1, 1);
        assert_eq!(a.cols(), 33_040);
        assert!(check_shapes::<SquaredDistance>(&a, &b, &c).is_ok());

        // One non-zero step inside the padding tips it over.
        let mut b = b;
        b.set(len, 0, 1);
        assert!(check_shapes::<SquaredDistance>(&a, &b, &c).is_err());
    }

    #[test]
    fn test_check_aligned() {
        let a = Matrix::<f32>::zeros(32, 48);
        let b = Matrix::<f32>::zeros(48, 16);
        assert!(check_aligned(&a, &b, 16).is_ok());
        assert!(check_aligned(&a, &b, 32).is_err());
    }

    #[test]
    fn test_engine_from_config() {
        let config = Config::default().with_backend(Backend::Tiled).with_tile(8);
        let engine = Engine::from_config(&config).unwrap();
        assert_eq!(engine.name(), "tiled");
        assert_eq!(engine.alignment(), 8);
        assert!(Engine::from_config(&config.with_tile(0)).is_err());
    }
}
