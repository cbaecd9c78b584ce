//! Accumulation modes of the tile engines.
//!
//! A [`TileOp`] fixes the operand element type, the accumulator type and the
//! per-element step. [`Product`] is the ordinary multiply-accumulate of a
//! matrix product; [`SquaredDistance`] replaces it by subtract-square-accumulate
//! so that `C[i][j]` becomes the squared L2 distance between row `i` of the
//! query batch and column `j` of the (transposed) reference set.

use std::fmt::Debug;
use std::ops::Add;

use num::{Bounded, Zero};

/// Largest squared difference of two 8-bit channel values.
pub const MAX_SQUARED_DIFF: i64 = 255 * 255;

/// Longest shared dimension for which [`SquaredDistance`] cannot overflow `i32`.
pub const MAX_DISTANCE_LEN: usize = (i32::MAX as i64 / MAX_SQUARED_DIFF) as usize;

// Photomosaic feature vectors are 3 x 32 x 32 bytes.
const _: () = assert!(3 * 32 * 32 <= MAX_DISTANCE_LEN);

/// Per-element accumulation rule of a tile engine.
pub trait TileOp: Send + Sync + 'static {
    /// Operand element type.
    type Elem: Copy + Default + Debug + PartialEq + Send + Sync + 'static;
    /// Accumulator / output element type.
    type Acc: Copy
        + Debug
        + PartialEq
        + PartialOrd
        + Zero
        + Bounded
        + Add<Output = Self::Acc>
        + Send
        + Sync
        + 'static;

    /// Short name used in logs.
    const NAME: &'static str;

    /// Longest shared dimension this mode accepts.
    const MAX_SHARED_DIM: usize = usize::MAX;

    /// One accumulation step.
    fn accumulate(acc: Self::Acc, a: Self::Elem, b: Self::Elem) -> Self::Acc;

    /// Accumulation step used by device kernels. Defaults to [`TileOp::accumulate`].
    #[inline(always)]
    fn accumulate_device(acc: Self::Acc, a: Self::Elem, b: Self::Elem) -> Self::Acc {
        Self::accumulate(acc, a, b)
    }
}

/// `C = A x B` with `f32` accumulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Product;

impl TileOp for Product {
    type Elem = f32;
    type Acc = f32;

    const NAME: &'static str = "product";

    #[inline(always)]
    fn accumulate(acc: f32, a: f32, b: f32) -> f32 {
        acc + a * b
    }
}

/// `C[i][j] = sum_k (A[i][k] - B[k][j])^2` over 8-bit channels with `i32` accumulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredDistance;

impl TileOp for SquaredDistance {
    type Elem = u8;
    type Acc = i32;

    const NAME: &'static str = "distance";
    const MAX_SHARED_DIM: usize = MAX_DISTANCE_LEN;

    #[inline(always)]
    fn accumulate(acc: i32, a: u8, b: u8) -> i32 {
        let d = a as i32 - b as i32;
        acc + d * d
    }

    #[inline(always)]
    fn accumulate_device(acc: i32, a: u8, b: u8) -> i32 {
        let d = a as i32 - b as i32;
        acc + mul24(d, d)
    }
}

/// Multiplies the low 24 bits of two signed integers, like the device
/// `mul24` built-in. Exact whenever both operands fit in 24 signed bits.
#[inline(always)]
pub fn mul24(x: i32, y: i32) -> i32 {
    let x = (x << 8) >> 8;
    let y = (y << 8) >> 8;
    x.wrapping_mul(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_accumulate() {
        assert_eq!(Product::accumulate(1.0, 2.0, 3.0), 7.0);
    }

    #[test]
    fn test_distance_accumulate() {
        assert_eq!(SquaredDistance::accumulate(0, 10, 3), 49);
        assert_eq!(SquaredDistance::accumulate(5, 0, 255), 5 + 65_025);
    }

    #[test]
    fn test_mul24_matches_exact_product_in_range() {
        for d in -255..=255 {
            assert_eq!(mul24(d, d), d * d);
        }
        assert_eq!(
            SquaredDistance::accumulate_device(7, 200, 13),
            SquaredDistance::accumulate(7, 200, 13)
        );
    }

    #[test]
    fn test_mul24_truncates_high_bits() {
        // 2^24 wraps to 0 in 24 bits.
        assert_eq!(mul24(1 << 24, 5), 0);
    }

    #[test]
    fn test_distance_bound() {
        assert_eq!(MAX_DISTANCE_LEN, 33_025);
        let worst = MAX_DISTANCE_LEN as i64 * MAX_SQUARED_DIFF;
        assert!(worst <= i32::MAX as i64);
    }
}
