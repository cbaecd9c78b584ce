//! Seeded synthetic inputs.
//!
//! Every generator takes an explicit seed so that a run can be reproduced.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::error::{dimension_error, Result};
use crate::matrix::Matrix;
use crate::mosaic::{Image, CHANNELS};
use crate::nearest::ReferenceSet;

/// A `rows x cols` matrix of floats in `[-0.5, 0.5)`.
pub fn random_matrix(rows: usize, cols: usize, seed: u64) -> Matrix<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Matrix::from_fn(rows, cols, |_, _| rng.random::<f32>() - 0.5)
}

/// A `rows x cols` matrix of bytes.
pub fn random_bytes(rows: usize, cols: usize, seed: u64) -> Matrix<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    Matrix::from_fn(rows, cols, |_, _| rng.random())
}

/// A random RGB image.
pub fn random_image(width: usize, height: usize, seed: u64) -> Result<Image> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pixels = vec![0u8; width * height * CHANNELS];
    rng.fill(pixels.as_mut_slice());
    Image::new(width, height, pixels)
}

/// A random reference set of `count` vectors in which a copy of every query
/// row is planted at a distinct random index. Returns the set and the
/// planted index of each query.
pub fn planted_references(
    queries: &Matrix<u8>,
    count: usize,
    seed: u64,
) -> Result<(ReferenceSet, Vec<usize>)> {
    if queries.rows() > count {
        return Err(dimension_error(format!(
            "cannot plant {} queries among {count} references",
            queries.rows()
        )));
    }
    let dim = queries.cols();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; count * dim];
    rng.fill(data.as_mut_slice());

    let planted = index::sample(&mut rng, count, queries.rows()).into_vec();
    for (q, &slot) in planted.iter().enumerate() {
        data[slot * dim..(slot + 1) * dim].copy_from_slice(queries.row(q));
    }
    Ok((ReferenceSet::new(data, count, dim)?, planted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_range_and_seed() {
        let m = random_matrix(8, 8, 7);
        assert!(m.as_slice().iter().all(|&x| (-0.5..0.5).contains(&x)));
        assert_eq!(m, random_matrix(8, 8, 7));
        assert_ne!(m, random_matrix(8, 8, 8));
    }

    #[test]
    fn test_planted_rows_are_copies() {
        let queries = random_bytes(5, 12, 1);
        let (refs, planted) = planted_references(&queries, 40, 2).unwrap();
        assert_eq!(planted.len(), 5);
        for (q, &slot) in planted.iter().enumerate() {
            assert_eq!(refs.vector(slot), queries.row(q));
        }
        assert!(planted_references(&queries, 4, 2).is_err());
    }

    #[test]
    fn test_random_image_size() {
        let image = random_image(64, 32, 3).unwrap();
        assert_eq!(image.pixels().len(), 64 * 32 * 3);
        assert!(random_image(33, 32, 3).is_err());
    }
}
