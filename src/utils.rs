//! Small sizing helpers shared by the engines and the device emulation.

use crate::error::{dimension_error, Result};

/// Rounds `value` up to the next multiple of `multiple`.
///
/// `multiple` must be non-zero.
///
/// # Example
///
/// ```rust
/// use tilemosaic::utils::round_up;
///
/// assert_eq!(round_up(60_000, 64), 60_032);
/// assert_eq!(round_up(128, 64), 128);
/// ```
#[inline(always)]
pub fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Rounds a global work size up to a whole number of work-groups.
#[inline(always)]
pub fn round_work_size(work_size: usize, group_size: usize) -> usize {
    match work_size % group_size {
        0 => work_size,
        rem => work_size + group_size - rem,
    }
}

/// Checks that `value` is a non-zero multiple of `tile`.
pub fn ensure_multiple(what: &str, value: usize, tile: usize) -> Result<()> {
    if tile == 0 {
        return Err(dimension_error(format!("{what}: tile size must be non-zero")));
    }
    if value == 0 || value % tile != 0 {
        return Err(dimension_error(format!(
            "{what} = {value} is not a non-zero multiple of tile size {tile}"
        )));
    }
    Ok(())
}

/// Copies `rows x cols` elements of `src` into a zero-extended buffer of
/// `padded_rows x padded_cols`, filling the margin with `fill`.
pub fn pad_row_major<T: Copy>(
    src: &[T],
    rows: usize,
    cols: usize,
    padded_rows: usize,
    padded_cols: usize,
    fill: T,
) -> Vec<T> {
    debug_assert!(padded_rows >= rows && padded_cols >= cols);
    let mut out = vec![fill; padded_rows * padded_cols];
    if rows == 0 || cols == 0 {
        return out;
    }
    for (dst, src) in out
        .chunks_exact_mut(padded_cols)
        .zip(src.chunks_exact(cols))
        .take(rows)
    {
        dst[..cols].copy_from_slice(src);
    }
    out
}
