//! Photomosaic front-end.
//!
//! An RGB image is cut into `32 x 32` patches. Each patch becomes one
//! feature vector of [`FEATURE_LEN`] bytes laid out `[channel][row][col]`,
//! the same layout as the reference patches. Every patch is replaced by the
//! nearest reference patch.

use rayon::prelude::*;
use tracing::info;

use crate::error::{dimension_error, validation_error, Result};
use crate::matrix::Matrix;
use crate::nearest::{Nearest, ReferenceSet};
use crate::reduce::ArgMin;

/// Edge of one patch in pixels.
pub const PATCH: usize = 32;

/// Interleaved colour channels per pixel.
pub const CHANNELS: usize = 3;

/// Bytes per patch feature vector.
pub const FEATURE_LEN: usize = CHANNELS * PATCH * PATCH;

/// An interleaved RGB image whose sides are multiples of [`PATCH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 || width % PATCH != 0 || height % PATCH != 0 {
            return Err(dimension_error(format!(
                "image sides must be non-zero multiples of {PATCH}, got {width}x{height}"
            )));
        }
        if pixels.len() != width * height * CHANNELS {
            return Err(validation_error(format!(
                "{width}x{height} RGB image needs {} bytes, got {}",
                width * height * CHANNELS,
                pixels.len()
            )));
        }
        Ok(Image {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Patches per row and per column.
    pub fn grid(&self) -> (usize, usize) {
        (self.width / PATCH, self.height / PATCH)
    }

    /// Channel `c` of pixel `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize, c: usize) -> u8 {
        self.pixels[(y * self.width + x) * CHANNELS + c]
    }
}

/// Cuts `image` into one feature vector per patch, in row-major patch order.
pub fn extract_patches(image: &Image) -> Result<Matrix<u8>> {
    let (sw, sh) = image.grid();
    let mut features = vec![0u8; sw * sh * FEATURE_LEN];
    features
        .par_chunks_mut(FEATURE_LEN)
        .enumerate()
        .for_each(|(patch, feature)| {
            let (x0, y0) = ((patch % sw) * PATCH, (patch / sw) * PATCH);
            for c in 0..CHANNELS {
                for h in 0..PATCH {
                    for w in 0..PATCH {
                        feature[(c * PATCH + h) * PATCH + w] = image.pixel(x0 + w, y0 + h, c);
                    }
                }
            }
        });
    Matrix::new(sw * sh, FEATURE_LEN, features)
}

/// Builds a `width x height` image whose patch `p` is reference patch
/// `indices[p]`.
pub fn assemble(
    width: usize,
    height: usize,
    indices: &[usize],
    refs: &ReferenceSet,
) -> Result<Image> {
    if refs.dim() != FEATURE_LEN {
        return Err(dimension_error(format!(
            "reference patches have {} bytes, expected {FEATURE_LEN}",
            refs.dim()
        )));
    }
    let mut image = Image::new(width, height, vec![0; width * height * CHANNELS])?;
    let (sw, sh) = image.grid();
    if indices.len() != sw * sh {
        return Err(validation_error(format!(
            "{} indices for {} patches",
            indices.len(),
            sw * sh
        )));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i >= refs.count()) {
        return Err(validation_error(format!(
            "index {bad} outside reference set of {}",
            refs.count()
        )));
    }

    let row_bytes = width * CHANNELS;
    image
        .pixels
        .par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            let (py, h) = (y / PATCH, y % PATCH);
            for (x, rgb) in row.chunks_exact_mut(CHANNELS).enumerate() {
                let patch = refs.vector(indices[py * sw + x / PATCH]);
                for (c, value) in rgb.iter_mut().enumerate() {
                    *value = patch[(c * PATCH + h) * PATCH + x % PATCH];
                }
            }
        });
    Ok(image)
}

/// Replaces every patch of `image` by its nearest reference patch.
pub fn photomosaic<S: Nearest>(
    search: &S,
    image: &Image,
    refs: &ReferenceSet,
) -> Result<(Image, Vec<ArgMin>)> {
    let queries = extract_patches(image)?;
    let best = search.nearest(&queries, refs)?;
    let indices: Vec<usize> = best.iter().map(|m| m.index).collect();
    let output = assemble(image.width(), image.height(), &indices, refs)?;
    info!(
        patches = best.len(),
        distance = best.iter().map(|m| m.distance as i64).sum::<i64>(),
        "photomosaic assembled"
    );
    Ok((output, best))
}
