//! Pair-space indexing
//!
//! Unordered pairs `{i, j}` with `0 <= i < j < n` are linearized row by row:
//! position `p` walks `(0,1), (0,2), ..., (0,n-1), (1,2), ...`. Row `i` starts
//! at `i * (2n - i - 1) / 2`, so every conversion here is closed-form and a
//! range of positions is materialized in time proportional to its length.

use crate::error::{PairwiseError, Result};

/// Number of unordered pairs over `n` elements.
///
/// Fails with `InvalidSize` when `n < 2` or when the count does not fit a
/// `u64` position (`n > 6_074_001_000`).
pub fn pair_count(n: usize) -> Result<u64> {
    if n < 2 {
        return Err(PairwiseError::InvalidSize { n });
    }
    let wide = n as u128;
    u64::try_from(wide * (wide - 1) / 2).map_err(|_| PairwiseError::InvalidSize { n })
}

/// Closed-form mapping between pair-space positions and `(row, col)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairIndexer {
    n: usize,
    total: u64,
}

impl PairIndexer {
    pub fn new(n: usize) -> Result<Self> {
        let total = pair_count(n)?;
        Ok(Self { n, total })
    }

    /// Number of elements.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Total number of pairs `C`.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Position of the first pair in `row`. `row_start(n - 1) == total`.
    pub fn row_start(&self, row: usize) -> Result<u64> {
        if row >= self.n {
            return Err(PairwiseError::InvalidPair {
                row,
                col: row + 1,
                n: self.n,
            });
        }
        Ok(self.start_of(row))
    }

    /// `row < n`, so the start never exceeds `total` and fits a `u64`.
    #[inline]
    fn start_of(&self, row: usize) -> u64 {
        let n = self.n as u128;
        let i = row as u128;
        u64::try_from(i * (2 * n - i - 1) / 2).unwrap_or(self.total)
    }

    /// Inverse of the canonical linearization.
    pub fn position_to_pair(&self, pos: u64) -> Result<(usize, usize)> {
        if pos >= self.total {
            return Err(PairwiseError::OutOfRange {
                pos,
                total: self.total,
            });
        }
        let row = self.row_of(pos);
        let col = row + 1 + (pos - self.start_of(row)) as usize;
        Ok((row, col))
    }

    /// Forward linearization of `(row, col)`, requiring `row < col < n`.
    pub fn pair_to_position(&self, row: usize, col: usize) -> Result<u64> {
        if row >= col || col >= self.n {
            return Err(PairwiseError::InvalidPair { row, col, n: self.n });
        }
        Ok(self.start_of(row) + (col - row - 1) as u64)
    }

    /// Every pair whose position lies in `[from_pos, to_pos)`, ascending.
    pub fn range_to_pairs(&self, from_pos: u64, to_pos: u64) -> Result<PairRange> {
        self.check_range(from_pos, to_pos)?;
        if from_pos == to_pos {
            return Ok(PairRange::empty(self.n));
        }
        let (row, col) = self.position_to_pair(from_pos)?;
        Ok(PairRange {
            n: self.n,
            row,
            col,
            remaining: to_pos - from_pos,
        })
    }

    /// Row-contiguous segments `(row, col_start, col_end)` covering
    /// `[from_pos, to_pos)`, one per touched row.
    pub fn row_segments(&self, from_pos: u64, to_pos: u64) -> Result<RowSegments> {
        self.check_range(from_pos, to_pos)?;
        Ok(RowSegments {
            indexer: *self,
            pos: from_pos,
            to_pos,
        })
    }

    pub(crate) fn check_range(&self, from_pos: u64, to_pos: u64) -> Result<()> {
        if from_pos > to_pos {
            return Err(PairwiseError::OutOfRange {
                pos: from_pos,
                total: self.total,
            });
        }
        if to_pos > self.total {
            return Err(PairwiseError::OutOfRange {
                pos: to_pos,
                total: self.total,
            });
        }
        Ok(())
    }

    /// Largest row whose start is `<= pos`.
    fn row_of(&self, pos: u64) -> usize {
        // Solve i^2 - (2n-1)i + 2p >= 0 for the smaller root, then correct
        // the float estimate with exact integer arithmetic.
        let b = 2.0 * self.n as f64 - 1.0;
        let disc = (b * b - 8.0 * pos as f64).max(0.0);
        let estimate = ((b - disc.sqrt()) / 2.0).floor().max(0.0) as usize;
        let mut row = estimate.min(self.n - 2);
        while row > 0 && self.start_of(row) > pos {
            row -= 1;
        }
        while row + 1 < self.n - 1 && self.start_of(row + 1) <= pos {
            row += 1;
        }
        row
    }
}

/// Lazy walk over a contiguous run of pair-space positions.
#[derive(Debug, Clone)]
pub struct PairRange {
    n: usize,
    row: usize,
    col: usize,
    remaining: u64,
}

impl PairRange {
    fn empty(n: usize) -> Self {
        Self {
            n,
            row: 0,
            col: 1,
            remaining: 0,
        }
    }
}

impl Iterator for PairRange {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let pair = (self.row, self.col);
        self.remaining -= 1;
        self.col += 1;
        if self.col == self.n {
            self.row += 1;
            self.col = self.row + 1;
        }
        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (len, Some(len))
    }
}

impl ExactSizeIterator for PairRange {}

/// Row-at-a-time walk over a validated position range.
#[derive(Debug, Clone)]
pub struct RowSegments {
    indexer: PairIndexer,
    pos: u64,
    to_pos: u64,
}

impl Iterator for RowSegments {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.to_pos {
            return None;
        }
        let row = self.indexer.row_of(self.pos);
        let col = row + 1 + (self.pos - self.indexer.start_of(row)) as usize;
        let end = self.indexer.start_of(row + 1).min(self.to_pos);
        let col_end = col + (end - self.pos) as usize;
        self.pos = end;
        Some((row, col, col_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn brute_pairs(n: usize) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                pairs.push((i, j));
            }
        }
        pairs
    }

    #[test]
    fn test_pair_count() {
        assert_eq!(pair_count(2).unwrap(), 1);
        assert_eq!(pair_count(4).unwrap(), 6);
        assert_eq!(pair_count(100).unwrap(), 4950);
        assert!(matches!(pair_count(1), Err(PairwiseError::InvalidSize { n: 1 })));
        assert!(matches!(pair_count(0), Err(PairwiseError::InvalidSize { n: 0 })));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_pair_count_u64_boundary() {
        assert_eq!(pair_count(6_074_001_000).unwrap(), 18_446_744_070_963_499_500);
        assert!(matches!(
            pair_count(6_074_001_001),
            Err(PairwiseError::InvalidSize { n: 6_074_001_001 })
        ));
        assert!(pair_count(7_000_000_000).is_err());
        assert!(PairIndexer::new(7_000_000_000).is_err());

        let idx = PairIndexer::new(6_074_001_000).unwrap();
        let last = idx.total() - 1;
        assert_eq!(idx.position_to_pair(last).unwrap(), (6_074_000_998, 6_074_000_999));
        assert_eq!(idx.row_start(6_074_000_999).unwrap(), idx.total());
        assert!(idx.row_start(6_074_001_000).is_err());
    }

    #[test]
    fn test_canonical_order_n4() {
        let idx = PairIndexer::new(4).unwrap();
        let pairs: Vec<_> = idx.range_to_pairs(0, 6).unwrap().collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn test_out_of_range() {
        let idx = PairIndexer::new(4).unwrap();
        assert!(matches!(
            idx.position_to_pair(6),
            Err(PairwiseError::OutOfRange { pos: 6, total: 6 })
        ));
        assert!(idx.range_to_pairs(0, 7).is_err());
        assert!(idx.range_to_pairs(4, 3).is_err());
        assert!(idx.pair_to_position(2, 2).is_err());
        assert!(idx.pair_to_position(1, 4).is_err());
    }

    #[test]
    fn test_empty_and_tail_ranges() {
        let idx = PairIndexer::new(10).unwrap();
        assert_eq!(idx.range_to_pairs(17, 17).unwrap().count(), 0);
        let tail: Vec<_> = idx.range_to_pairs(44, 45).unwrap().collect();
        assert_eq!(tail, vec![(8, 9)]);
    }

    #[test]
    fn test_row_segments() {
        let idx = PairIndexer::new(5).unwrap();
        // positions 2..7 -> (0,3),(0,4),(1,2),(1,3),(1,4)
        let segs: Vec<_> = idx.row_segments(2, 7).unwrap().collect();
        assert_eq!(segs, vec![(0, 3, 5), (1, 2, 5)]);
        assert_eq!(idx.row_segments(3, 3).unwrap().count(), 0);
    }

    #[test]
    fn test_large_n_roundtrip_edges() {
        let n = 3_000_000;
        let idx = PairIndexer::new(n).unwrap();
        let last = idx.total() - 1;
        assert_eq!(idx.position_to_pair(last).unwrap(), (n - 2, n - 1));
        assert_eq!(idx.position_to_pair(0).unwrap(), (0, 1));
        let mid = idx.row_start(1_234_567).unwrap();
        assert_eq!(idx.position_to_pair(mid).unwrap(), (1_234_567, 1_234_568));
        assert_eq!(idx.position_to_pair(mid - 1).unwrap(), (1_234_566, n - 1));
    }

    proptest! {
        #[test]
        fn prop_bijection(n in 2usize..80) {
            let idx = PairIndexer::new(n).unwrap();
            let expected = brute_pairs(n);
            prop_assert_eq!(idx.total() as usize, expected.len());
            for (p, &(i, j)) in expected.iter().enumerate() {
                prop_assert_eq!(idx.position_to_pair(p as u64).unwrap(), (i, j));
                prop_assert_eq!(idx.pair_to_position(i, j).unwrap(), p as u64);
            }
        }

        #[test]
        fn prop_range_matches_slice(n in 2usize..60, a in 0u64..2000, b in 0u64..2000) {
            let idx = PairIndexer::new(n).unwrap();
            let total = idx.total();
            let (from, to) = (a.min(b) % (total + 1), a.max(b) % (total + 1));
            let (from, to) = (from.min(to), from.max(to));
            let got: Vec<_> = idx.range_to_pairs(from, to).unwrap().collect();
            let all = brute_pairs(n);
            prop_assert_eq!(&got[..], &all[from as usize..to as usize]);
        }
    }
}
