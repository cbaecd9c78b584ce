//! # Cache-Blocked Tile Engine
//!
//! The output is walked in `tile x tile` blocks `(ii, jj)`. For every output
//! block the shared dimension is consumed in `tile`-wide steps `t`:
//!
//! 1. **Stage**: copy `A(ii, t)` and `B(t, jj)` into contiguous scratch tiles.
//! 2. **Accumulate**: perform the `tile^3` accumulation steps into a scratch
//!    accumulator tile that lives for the whole `t` loop.
//! 3. **Store**: once every step is consumed, write the accumulator tile to `C`
//!    exactly once.
//!
//! Staged tiles are reused `tile` times each, so the two operands are read
//! `R / tile` and `P / tile` times instead of once per output element.
//!
//! The accumulation order along the shared dimension is the plain `k = 0..Q`
//! order, so product-mode results are bit-identical to the triple loop.

use num::Zero;

use crate::engine::{check_aligned, check_shapes, TileEngine};
use crate::error::{setup_error, Result};
use crate::kernel::TileOp;
use crate::matrix::Matrix;

/// Single-threaded blocked engine.
#[derive(Debug, Clone, Copy)]
pub struct TiledEngine {
    tile: usize,
}

impl TiledEngine {
    /// Engine with square `tile x tile` blocks. Operands must be multiples of
    /// `tile` in every dimension.
    pub fn new(tile: usize) -> Result<Self> {
        if tile == 0 {
            return Err(setup_error("tiled engine", "tile size must be non-zero"));
        }
        Ok(TiledEngine { tile })
    }

    pub fn tile(&self) -> usize {
        self.tile
    }
}

impl TileEngine for TiledEngine {
    fn name(&self) -> &'static str {
        "tiled"
    }

    fn alignment(&self) -> usize {
        self.tile
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        check_shapes::<Op>(a, b, c)?;
        check_aligned(a, b, self.tile)?;
        let (q, r) = (a.cols(), b.cols());
        tile_rows::<Op>(a.as_slice(), b.as_slice(), c.as_mut_slice(), 0, q, r, self.tile);
        Ok(())
    }
}

/// Scratch tiles of one worker. Allocated once and reused for every block.
struct TileScratch<Op: TileOp> {
    asub: Vec<Op::Elem>,
    bsub: Vec<Op::Elem>,
    csub: Vec<Op::Acc>,
}

impl<Op: TileOp> TileScratch<Op> {
    fn new(tile: usize) -> Self {
        TileScratch {
            asub: vec![Op::Elem::default(); tile * tile],
            bsub: vec![Op::Elem::default(); tile * tile],
            csub: vec![Op::Acc::zero(); tile * tile],
        }
    }
}

/// Computes the block rows held in `c_rows`, whose first row is global row
/// `row_start`. `c_rows.len()` must be a multiple of `tile * r`, and `q`, `r`
/// multiples of `tile`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tile_rows<Op: TileOp>(
    a: &[Op::Elem],
    b: &[Op::Elem],
    c_rows: &mut [Op::Acc],
    row_start: usize,
    q: usize,
    r: usize,
    tile: usize,
) {
    let mut scratch = TileScratch::<Op>::new(tile);
    let TileScratch { asub, bsub, csub } = &mut scratch;
    let num_row_tiles = c_rows.len() / (tile * r);
    let num_col_tiles = r / tile;
    let num_tiles = q / tile;

    for ii in 0..num_row_tiles {
        let a_row0 = row_start + ii * tile;
        for jj in 0..num_col_tiles {
            csub.fill(Op::Acc::zero());

            for t in 0..num_tiles {
                // stage asub <- A(ii, t), bsub <- B(t, jj)
                for i in 0..tile {
                    let a_src = (a_row0 + i) * q + t * tile;
                    asub[i * tile..(i + 1) * tile].copy_from_slice(&a[a_src..a_src + tile]);
                    let b_src = (t * tile + i) * r + jj * tile;
                    bsub[i * tile..(i + 1) * tile].copy_from_slice(&b[b_src..b_src + tile]);
                }

                for i in 0..tile {
                    let c_row = &mut csub[i * tile..(i + 1) * tile];
                    for k in 0..tile {
                        let a_ik = asub[i * tile + k];
                        let b_row = &bsub[k * tile..(k + 1) * tile];
                        for (acc, &b_kj) in c_row.iter_mut().zip(b_row) {
                            *acc = Op::accumulate(*acc, a_ik, b_kj);
                        }
                    }
                }
            }

            // store csub -> C
            for i in 0..tile {
                let dst = (ii * tile + i) * r + jj * tile;
                c_rows[dst..dst + tile].copy_from_slice(&csub[i * tile..(i + 1) * tile]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BasicEngine;
    use crate::kernel::{Product, SquaredDistance};

    fn create_test_matrix(rows: usize, cols: usize) -> Matrix<f32> {
        Matrix::from_fn(rows, cols, |i, j| ((i * 7 + j * 3) % 11) as f32 * 0.25 - 1.0)
    }

    #[test]
    fn test_tiled_matches_basic_bitwise() {
        let a = create_test_matrix(32, 48);
        let b = create_test_matrix(48, 64);
        let mut c_tiled = Matrix::zeros(32, 64);
        let mut c_basic = Matrix::zeros(32, 64);

        TiledEngine::new(16)
            .unwrap()
            .multiply::<Product>(&a, &b, &mut c_tiled)
            .unwrap();
        BasicEngine.multiply::<Product>(&a, &b, &mut c_basic).unwrap();

        assert_eq!(c_tiled, c_basic);
    }

    #[test]
    fn test_tiled_distance_small_tile() {
        let a = Matrix::from_fn(8, 12, |i, j| ((i * 31 + j * 17) % 256) as u8);
        let b = Matrix::from_fn(12, 4, |i, j| ((i * 13 + j * 101) % 256) as u8);
        let mut c_tiled = Matrix::zeros(8, 4);
        let mut c_basic = Matrix::zeros(8, 4);

        TiledEngine::new(4)
            .unwrap()
            .multiply::<SquaredDistance>(&a, &b, &mut c_tiled)
            .unwrap();
        BasicEngine
            .multiply::<SquaredDistance>(&a, &b, &mut c_basic)
            .unwrap();

        assert_eq!(c_tiled, c_basic);
    }

    #[test]
    fn test_tiled_rejects_unaligned() {
        let a = create_test_matrix(20, 16);
        let b = create_test_matrix(16, 16);
        let mut c = Matrix::zeros(20, 16);
        let result = TiledEngine::new(16)
            .unwrap()
            .multiply::<Product>(&a, &b, &mut c);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_tile_rejected() {
        assert!(TiledEngine::new(0).is_err());
    }
}
