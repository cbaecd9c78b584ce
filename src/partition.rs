//! Balanced contiguous work partitioning.
//!
//! Every backend (thread pool, device set, message-passing ranks) splits the
//! output rows with the same policy: `base = N / W`, the first `N % W`
//! workers get one extra unit, and offsets are a running sum of the counts.
//! Because the offsets are a running sum rather than `index * base`, the
//! uneven remainder never leaves a gap or an overlap.

use std::ops::Range;

use crate::error::{dimension_error, setup_error, Result};

/// An ordered, non-overlapping cover of `[0, total)` with one range per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    ranges: Vec<Range<usize>>,
}

impl Partition {
    /// Splits `total` units among `workers`.
    pub fn even(total: usize, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(setup_error("partition", "worker count must be at least 1"));
        }
        let base = total / workers;
        let remainder = total % workers;
        let mut ranges = Vec::with_capacity(workers);
        let mut offset = 0;
        for w in 0..workers {
            let count = if w < remainder { base + 1 } else { base };
            ranges.push(offset..offset + count);
            offset += count;
        }
        Ok(Partition { ranges })
    }

    /// Splits `rows` output rows among `workers` in whole blocks of
    /// `granularity` rows. `rows` must be a multiple of `granularity`.
    pub fn rows(rows: usize, granularity: usize, workers: usize) -> Result<Self> {
        if granularity == 0 || rows % granularity != 0 {
            return Err(dimension_error(format!(
                "{rows} rows cannot be split in blocks of {granularity}"
            )));
        }
        Ok(Self::even(rows / granularity, workers)?.scaled(granularity))
    }

    /// Multiplies every boundary by `unit`, e.g. rows to elements or bytes.
    pub fn scaled(&self, unit: usize) -> Partition {
        Partition {
            ranges: self
                .ranges
                .iter()
                .map(|r| r.start * unit..r.end * unit)
                .collect(),
        }
    }

    /// Number of workers, including those with an empty range.
    pub fn workers(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of units covered.
    pub fn total(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    /// Units owned by `worker`. Panics if `worker` is out of range.
    pub fn range(&self, worker: usize) -> Range<usize> {
        self.ranges[worker].clone()
    }

    /// Every worker's range, in worker order.
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Units assigned to each worker.
    pub fn counts(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.len()).collect()
    }

    /// First unit of each worker.
    pub fn offsets(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.start).collect()
    }

    /// Splits `data` into one disjoint mutable slice per worker.
    ///
    /// `data.len()` must equal [`Partition::total`].
    pub fn split_mut<'a, T>(&self, data: &'a mut [T]) -> Result<Vec<&'a mut [T]>> {
        if data.len() != self.total() {
            return Err(dimension_error(format!(
                "partition covers {} elements, buffer has {}",
                self.total(),
                data.len()
            )));
        }
        let mut parts = Vec::with_capacity(self.ranges.len());
        let mut rest = data;
        for r in &self.ranges {
            let (head, tail) = rest.split_at_mut(r.len());
            parts.push(head);
            rest = tail;
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_with_remainder() {
        let p = Partition::even(10, 4).unwrap();
        assert_eq!(p.counts(), vec![3, 3, 2, 2]);
        assert_eq!(p.offsets(), vec![0, 3, 6, 8]);
        assert_eq!(p.total(), 10);
    }

    #[test]
    fn test_more_workers_than_units() {
        let p = Partition::even(2, 5).unwrap();
        assert_eq!(p.counts(), vec![1, 1, 0, 0, 0]);
        assert_eq!(p.range(4), 2..2);
    }

    #[test]
    fn test_zero_workers_is_setup_error() {
        assert!(Partition::even(10, 0).is_err());
    }

    #[test]
    fn test_rows_scales_blocks() {
        let p = Partition::rows(80, 16, 3).unwrap();
        assert_eq!(p.counts(), vec![32, 32, 16]);
        assert!(Partition::rows(81, 16, 3).is_err());
    }

    #[test]
    fn test_scaled_counts() {
        // Photomosaic scatter: tiles per node, then bytes per node.
        let p = Partition::even(7, 3).unwrap().scaled(3072);
        assert_eq!(p.counts(), vec![3 * 3072, 2 * 3072, 2 * 3072]);
        assert_eq!(p.offsets(), vec![0, 3 * 3072, 5 * 3072]);
    }

    #[test]
    fn test_split_mut_is_disjoint() {
        let p = Partition::even(7, 3).unwrap();
        let mut data = vec![0usize; 7];
        for (w, part) in p.split_mut(&mut data).unwrap().into_iter().enumerate() {
            part.iter_mut().for_each(|x| *x = w);
        }
        assert_eq!(data, vec![0, 0, 0, 1, 1, 2, 2]);
        assert!(p.split_mut(&mut vec![0usize; 6]).is_err());
    }
}
