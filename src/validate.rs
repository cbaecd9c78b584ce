//! Result validation against a naive reference.
//!
//! A mismatch is reported, never raised: the report lists every flagged
//! element and the caller decides what to do with it.

use std::fmt;

use tracing::{info, warn};

use crate::engine::{check_shapes, BasicEngine, TileEngine};
use crate::error::Result;
use crate::kernel::{Product, SquaredDistance, TileOp};
use crate::matrix::Matrix;
use crate::nearest::{naive_nearest, ReferenceSet};
use crate::reduce::ArgMin;

/// Absolute and relative tolerance for product results.
pub const EPSILON: f32 = 1e-3;

/// Listed mismatches beyond which only the count is kept.
const MAX_LISTED: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub row: usize,
    pub col: usize,
    pub computed: f64,
    pub expected: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub mismatches: usize,
    /// The first mismatches, in row-major order.
    pub first: Vec<Mismatch>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches == 0
    }

    fn flag(&mut self, row: usize, col: usize, computed: f64, expected: f64) {
        self.mismatches += 1;
        if self.first.len() < MAX_LISTED {
            self.first.push(Mismatch {
                row,
                col,
                computed,
                expected,
            });
        }
    }

    fn log(self, what: &str) -> Self {
        if self.is_valid() {
            info!(what, checked = self.checked, "result valid");
        } else {
            warn!(what, checked = self.checked, mismatches = self.mismatches, "result invalid");
        }
        self
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return write!(f, "valid ({} elements)", self.checked);
        }
        write!(f, "{} of {} elements differ", self.mismatches, self.checked)?;
        for m in &self.first {
            write!(
                f,
                "\n  [{}][{}]: got {}, expected {}",
                m.row, m.col, m.computed, m.expected
            )?;
        }
        Ok(())
    }
}

/// True when `computed` is off from `expected` both absolutely and
/// relatively. An exact zero reference uses the absolute test alone.
pub fn differs(computed: f32, expected: f32) -> bool {
    let diff = (computed - expected).abs();
    diff > EPSILON && (expected == 0.0 || (diff / expected).abs() > EPSILON)
}

/// Checks `c` against the naive product of `a` and `b`.
pub fn validate_product(
    a: &Matrix<f32>,
    b: &Matrix<f32>,
    c: &Matrix<f32>,
) -> Result<ValidationReport> {
    check_shapes::<Product>(a, b, c)?;
    let mut expected = Matrix::zeros(c.rows(), c.cols());
    BasicEngine.multiply::<Product>(a, b, &mut expected)?;

    let mut report = ValidationReport {
        checked: c.rows() * c.cols(),
        ..Default::default()
    };
    for i in 0..c.rows() {
        for j in 0..c.cols() {
            let (got, want) = (c.get(i, j), expected.get(i, j));
            if differs(got, want) {
                report.flag(i, j, got as f64, want as f64);
            }
        }
    }
    Ok(report.log(Product::NAME))
}

/// Checks a distance matrix exactly against the naive one.
pub fn validate_distances(
    a: &Matrix<u8>,
    b: &Matrix<u8>,
    c: &Matrix<i32>,
) -> Result<ValidationReport> {
    check_shapes::<SquaredDistance>(a, b, c)?;
    let mut expected = Matrix::zeros(c.rows(), c.cols());
    BasicEngine.multiply::<SquaredDistance>(a, b, &mut expected)?;

    let mut report = ValidationReport {
        checked: c.rows() * c.cols(),
        ..Default::default()
    };
    for i in 0..c.rows() {
        for j in 0..c.cols() {
            let (got, want) = (c.get(i, j), expected.get(i, j));
            if got != want {
                report.flag(i, j, got as f64, want as f64);
            }
        }
    }
    Ok(report.log(SquaredDistance::NAME))
}

/// Checks nearest-search results exactly against a brute-force search.
/// Column 0 of a mismatch is the distance, column 1 the index.
pub fn validate_nearest(
    queries: &Matrix<u8>,
    refs: &ReferenceSet,
    found: &[ArgMin],
) -> Result<ValidationReport> {
    let expected = naive_nearest(queries, refs)?;
    let mut report = ValidationReport {
        checked: expected.len(),
        ..Default::default()
    };
    if found.len() != expected.len() {
        report.mismatches = expected.len().abs_diff(found.len());
    }
    for (i, (got, want)) in found.iter().zip(&expected).enumerate() {
        if got.distance != want.distance {
            report.flag(i, 0, got.distance as f64, want.distance as f64);
        } else if got.index != want.index {
            report.flag(i, 1, got.index as f64, want.index as f64);
        }
    }
    Ok(report.log("nearest"))
}
