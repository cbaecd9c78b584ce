//! Arg-min reduction of distance matrices.
//!
//! The device reduces each row in two levels: 256-lane groups produce one
//! partial per group, and the host merges the partials of a row linearly.
//! [`two_level_argmin`] runs the same two levels on the CPU; [`row_argmin`]
//! is the single-pass scan used by the CPU backends.

use rayon::prelude::*;

use crate::error::{dimension_error, Result};
use crate::gpu::REDUCTION_WIDTH;
use crate::matrix::Matrix;

/// Best candidate of one query.
///
/// Orders by distance, then index, so the derived `Ord` picks the lowest
/// index among equal distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArgMin {
    pub distance: i32,
    pub index: usize,
}

impl ArgMin {
    /// Loses against every real candidate.
    pub const SENTINEL: ArgMin = ArgMin {
        distance: i32::MAX,
        index: usize::MAX,
    };

    pub fn new(distance: i32, index: usize) -> Self {
        ArgMin { distance, index }
    }

    /// Builds a candidate from a device partial, mapping the device sentinel
    /// index back to [`ArgMin::SENTINEL`].
    pub fn from_device(distance: i32, index: u32) -> Self {
        if index == u32::MAX {
            ArgMin::SENTINEL
        } else {
            ArgMin::new(distance, index as usize)
        }
    }

    pub fn is_sentinel(&self) -> bool {
        *self == ArgMin::SENTINEL
    }

    #[inline]
    pub fn better(self, other: ArgMin) -> ArgMin {
        self.min(other)
    }
}

impl Default for ArgMin {
    fn default() -> Self {
        ArgMin::SENTINEL
    }
}

/// Scans the first `valid` columns of every row.
pub fn row_argmin(dist: &Matrix<i32>, valid: usize) -> Result<Vec<ArgMin>> {
    check_valid(dist, valid)?;
    let cols = dist.cols();
    Ok(dist
        .as_slice()
        .par_chunks(cols)
        .map(|row| {
            row[..valid]
                .iter()
                .enumerate()
                .fold(ArgMin::SENTINEL, |best, (j, &d)| best.better(ArgMin::new(d, j)))
        })
        .collect())
}

/// Merges `partials_per_row` device partials per row into one candidate per
/// row. `dist` and `idx` are laid out row after row.
pub fn merge_partials(dist: &[i32], idx: &[u32], partials_per_row: usize) -> Result<Vec<ArgMin>> {
    if partials_per_row == 0 || dist.len() != idx.len() || dist.len() % partials_per_row != 0 {
        return Err(dimension_error(format!(
            "{} distances and {} indices do not form rows of {partials_per_row} partials",
            dist.len(),
            idx.len()
        )));
    }
    Ok(dist
        .par_chunks(partials_per_row)
        .zip(idx.par_chunks(partials_per_row))
        .map(|(d, i)| {
            d.iter()
                .zip(i)
                .fold(ArgMin::SENTINEL, |best, (&d, &i)| {
                    best.better(ArgMin::from_device(d, i))
                })
        })
        .collect())
}

/// Reduces each row in groups of `width` columns with a halving tree, then
/// merges the group partials.
pub fn two_level_argmin(dist: &Matrix<i32>, valid: usize, width: usize) -> Result<Vec<ArgMin>> {
    check_valid(dist, valid)?;
    if width == 0 || !width.is_power_of_two() {
        return Err(dimension_error(format!(
            "reduction width {width} is not a power of two"
        )));
    }
    let cols = dist.cols();
    let groups = cols.div_ceil(width);

    let partials = dist
        .as_slice()
        .par_chunks(cols)
        .flat_map_iter(|row| {
            (0..groups).map(move |g| {
                let mut lanes: Vec<ArgMin> = (0..width)
                    .map(|lane| {
                        let j = g * width + lane;
                        if j < valid {
                            ArgMin::new(row[j], j)
                        } else {
                            ArgMin::SENTINEL
                        }
                    })
                    .collect();
                let mut stride = width / 2;
                while stride >= 1 {
                    for lane in 0..stride {
                        lanes[lane] = lanes[lane].better(lanes[lane + stride]);
                    }
                    stride /= 2;
                }
                lanes[0]
            })
        })
        .collect::<Vec<_>>();

    Ok(partials
        .par_chunks(groups)
        .map(|row| row.iter().fold(ArgMin::SENTINEL, |best, &p| best.better(p)))
        .collect())
}

/// Two-level reduction with the device group width.
pub fn device_style_argmin(dist: &Matrix<i32>, valid: usize) -> Result<Vec<ArgMin>> {
    two_level_argmin(dist, valid, REDUCTION_WIDTH)
}

fn check_valid(dist: &Matrix<i32>, valid: usize) -> Result<()> {
    if valid == 0 || valid > dist.cols() {
        return Err(dimension_error(format!(
            "{valid} valid columns in a matrix of {} columns",
            dist.cols()
        )));
    }
    Ok(())
}
