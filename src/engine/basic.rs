use num::Zero;

use crate::engine::{check_shapes, TileEngine};
use crate::error::Result;
use crate::kernel::TileOp;
use crate::matrix::Matrix;

/// Single-threaded i-k-j triple loop without tiling.
///
/// Streams one row of `B` per step of the shared dimension; used as the
/// baseline the tiled backends are measured against.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEngine;

impl TileEngine for BasicEngine {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn alignment(&self) -> usize {
        1
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        check_shapes::<Op>(a, b, c)?;
        let (q, r) = (a.cols(), b.cols());
        basic_rows::<Op>(a.as_slice(), b.as_slice(), c.as_mut_slice(), 0, q, r);
        Ok(())
    }
}

/// Computes the output rows held in `c_rows`, the first of which is global
/// row `row_start`, with the i-k-j loop order.
pub(crate) fn basic_rows<Op: TileOp>(
    a: &[Op::Elem],
    b: &[Op::Elem],
    c_rows: &mut [Op::Acc],
    row_start: usize,
    q: usize,
    r: usize,
) {
    for (i, c_row) in c_rows.chunks_exact_mut(r).enumerate() {
        c_row.fill(Op::Acc::zero());
        let a_row = &a[(row_start + i) * q..(row_start + i + 1) * q];
        for (k, &val) in a_row.iter().enumerate() {
            let b_row = &b[k * r..(k + 1) * r];
            for (acc, &b_kj) in c_row.iter_mut().zip(b_row) {
                *acc = Op::accumulate(*acc, val, b_kj);
            }
        }
    }
}
