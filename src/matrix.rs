//! Row-major dense matrices.
//!
//! [`Matrix`] owns its elements and carries its dimensions at runtime. All
//! engines take operands and the output by reference, so buffers are always
//! allocated by the caller.

use ndarray::Array2;

use crate::error::{dimension_error, Result};
use crate::utils::{pad_row_major, round_up};

/// Edge of the square blocks used by [`Matrix::transpose`].
const TRANSPOSE_BLOCK: usize = 16;

/// A row-major dense matrix, element `(i, j)` at `data[i * cols + j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    /// Wraps `data` as a `rows x cols` matrix.
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(dimension_error(format!(
                "matrix {rows}x{cols} needs {} elements, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Matrix { rows, cols, data })
    }

    /// A `rows x cols` matrix with every element set to `value`.
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Builds a matrix from a function of `(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Matrix { rows, cols, data }
    }

    #[inline(always)]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline(always)]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline(always)]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[i * self.cols + j]
    }

    #[inline(always)]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        self.data[i * self.cols + j] = value;
    }

    /// Row `i` as a slice.
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Rows `start..end` as one contiguous slice.
    pub fn row_block(&self, start: usize, end: usize) -> &[T] {
        &self.data[start * self.cols..end * self.cols]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Returns a copy extended to multiples of `row_multiple` x `col_multiple`,
    /// the margin filled with `fill`.
    pub fn padded(&self, row_multiple: usize, col_multiple: usize, fill: T) -> Matrix<T> {
        let rows = round_up(self.rows, row_multiple);
        let cols = round_up(self.cols, col_multiple);
        if rows == self.rows && cols == self.cols {
            return self.clone();
        }
        Matrix {
            rows,
            cols,
            data: pad_row_major(&self.data, self.rows, self.cols, rows, cols, fill),
        }
    }

    /// Returns the top-left `rows x cols` corner.
    pub fn cropped(&self, rows: usize, cols: usize) -> Result<Matrix<T>> {
        if rows > self.rows || cols > self.cols {
            return Err(dimension_error(format!(
                "cannot crop {}x{} matrix to {rows}x{cols}",
                self.rows, self.cols
            )));
        }
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            data.extend_from_slice(&self.row(i)[..cols]);
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Transposes in square blocks so that both the read and the write side
    /// stay within a few cache lines.
    pub fn transpose(&self) -> Matrix<T> {
        let (p, q) = (self.rows, self.cols);
        if p == 0 || q == 0 {
            return Matrix {
                rows: q,
                cols: p,
                data: Vec::new(),
            };
        }
        let mut data = vec![self.data[0]; p * q];
        for ib in (0..p).step_by(TRANSPOSE_BLOCK) {
            for jb in (0..q).step_by(TRANSPOSE_BLOCK) {
                for i in ib..(ib + TRANSPOSE_BLOCK).min(p) {
                    for j in jb..(jb + TRANSPOSE_BLOCK).min(q) {
                        data[j * p + i] = self.data[i * q + j];
                    }
                }
            }
        }
        Matrix {
            rows: q,
            cols: p,
            data,
        }
    }

    /// Converts into an `ndarray` array of the same shape.
    pub fn to_array2(&self) -> Array2<T> {
        Array2::from_shape_fn((self.rows, self.cols), |(i, j)| self.get(i, j))
    }
}

impl<T: Copy + Default> Matrix<T> {
    /// A `rows x cols` matrix of `T::default()`.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, T::default())
    }
}

impl Matrix<f32> {
    /// The `n x n` identity matrix.
    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 })
    }
}

impl<T: Copy> From<Array2<T>> for Matrix<T> {
    fn from(array: Array2<T>) -> Self {
        let (rows, cols) = array.dim();
        Matrix {
            rows,
            cols,
            data: array.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_new_checks_length() {
        assert!(Matrix::new(2, 3, vec![0.0f32; 6]).is_ok());
        assert!(Matrix::new(2, 3, vec![0.0f32; 5]).is_err());
    }

    #[test]
    fn test_row_major_indexing() {
        // | 1 2 3 |
        // | 4 5 6 |
        let m = Matrix::new(2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(m.get(0, 2), 3);
        assert_eq!(m.get(1, 0), 4);
        assert_eq!(m.row(1), &[4, 5, 6]);
        assert_eq!(m.row_block(1, 2), &[4, 5, 6]);
    }

    #[test]
    fn test_transpose_non_square() {
        let m = Matrix::from_fn(37, 19, |i, j| (i * 100 + j) as i32);
        let t = m.transpose();
        assert_eq!((t.rows(), t.cols()), (19, 37));
        for i in 0..37 {
            for j in 0..19 {
                assert_eq!(t.get(j, i), m.get(i, j));
            }
        }
        assert_eq!(t.transpose(), m);
    }

    #[test]
    fn test_pad_and_crop() {
        let m = Matrix::from_fn(3, 5, |i, j| (i + j) as u8);
        let p = m.padded(4, 8, 9);
        assert_eq!((p.rows(), p.cols()), (4, 8));
        assert_eq!(p.get(2, 4), m.get(2, 4));
        assert_eq!(p.get(3, 0), 9);
        assert_eq!(p.get(0, 7), 9);
        assert_eq!(p.cropped(3, 5).unwrap(), m);
        assert!(m.cropped(4, 5).is_err());
    }

    #[test]
    fn test_ndarray_round_trip() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let m = Matrix::from(a.clone());
        assert_eq!(m.get(2, 1), 6.0);
        assert_eq!(m.to_array2(), a);
    }

    #[test]
    fn test_identity() {
        let i = Matrix::identity(3);
        assert_eq!(i.as_slice(), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
