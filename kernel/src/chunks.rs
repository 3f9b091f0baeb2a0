//! Fixed-size chunking of a pair-space range

use crate::error::{PairwiseError, Result};
use crate::indexer::PairIndexer;

/// A bounded batch of pairs materialized as parallel index arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the first pair.
    pub start: u64,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One past the position of the last pair.
    pub fn end(&self) -> u64 {
        self.start + self.rows.len() as u64
    }

    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }
}

/// Lazy sequence of chunks covering `[from_pos, to_pos)` in position order.
#[derive(Debug, Clone)]
pub struct ChunkIterator {
    indexer: PairIndexer,
    from_pos: u64,
    to_pos: u64,
    step_size: usize,
    cursor: u64,
}

impl ChunkIterator {
    pub fn new(indexer: PairIndexer, from_pos: u64, to_pos: u64, step_size: usize) -> Result<Self> {
        if step_size == 0 {
            return Err(PairwiseError::InvalidConfig(
                "step_size must be positive".to_string(),
            ));
        }
        indexer.check_range(from_pos, to_pos)?;
        Ok(Self {
            indexer,
            from_pos,
            to_pos,
            step_size,
            cursor: from_pos,
        })
    }

    /// Rewind to the start of the range.
    pub fn restart(&mut self) {
        self.cursor = self.from_pos;
    }

    /// Position the next chunk will start at.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of chunks still to be produced.
    pub fn remaining_chunks(&self) -> u64 {
        let left = self.to_pos - self.cursor;
        left.div_ceil(self.step_size as u64)
    }
}

impl Iterator for ChunkIterator {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.cursor >= self.to_pos {
            return None;
        }
        let start = self.cursor;
        let end = (start + self.step_size as u64).min(self.to_pos);
        let len = (end - start) as usize;

        let mut rows = Vec::with_capacity(len);
        let mut cols = Vec::with_capacity(len);
        // Range was validated in `new`; sub-windows stay inside it.
        let segments = self.indexer.row_segments(start, end).ok()?;
        for (row, col_start, col_end) in segments {
            rows.extend(std::iter::repeat(row).take(col_end - col_start));
            cols.extend(col_start..col_end);
        }

        self.cursor = end;
        Some(Chunk { start, rows, cols })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining_chunks()).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_n4_step2() {
        let idx = PairIndexer::new(4).unwrap();
        let chunks: Vec<Chunk> = ChunkIterator::new(idx, 0, 6, 2).unwrap().collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 2));
        assert_eq!(chunks[0].pairs().collect::<Vec<_>>(), vec![(0, 1), (0, 2)]);
        assert_eq!(chunks[1].pairs().collect::<Vec<_>>(), vec![(0, 3), (1, 2)]);
        assert_eq!(chunks[2].pairs().collect::<Vec<_>>(), vec![(1, 3), (2, 3)]);
        assert_eq!(chunks[2].start, 4);
        assert_eq!(chunks[2].end(), 6);
    }

    #[test]
    fn test_zero_step_rejected() {
        let idx = PairIndexer::new(4).unwrap();
        assert!(matches!(
            ChunkIterator::new(idx, 0, 6, 0),
            Err(PairwiseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_range_yields_nothing() {
        let idx = PairIndexer::new(4).unwrap();
        let mut it = ChunkIterator::new(idx, 3, 3, 5).unwrap();
        assert_eq!(it.remaining_chunks(), 0);
        assert!(it.next().is_none());
    }

    #[test]
    fn test_restart() {
        let idx = PairIndexer::new(7).unwrap();
        let mut it = ChunkIterator::new(idx, 2, 19, 4).unwrap();
        assert_eq!(it.len(), 5);
        let first: Vec<Chunk> = it.by_ref().collect();
        assert_eq!(it.cursor(), 19);
        it.restart();
        let second: Vec<Chunk> = it.collect();
        assert_eq!(first, second);
        assert_eq!(first.last().unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn prop_chunking_is_lossless(
            n in 2usize..50,
            a in 0u64..1500,
            b in 0u64..1500,
            step in 1usize..40,
        ) {
            let idx = PairIndexer::new(n).unwrap();
            let total = idx.total();
            let (x, y) = (a % (total + 1), b % (total + 1));
            let (from, to) = (x.min(y), x.max(y));
            let expected: Vec<_> = idx.range_to_pairs(from, to).unwrap().collect();

            let mut got = Vec::new();
            let mut next_start = from;
            for chunk in ChunkIterator::new(idx, from, to, step).unwrap() {
                prop_assert!(chunk.len() <= step);
                prop_assert!(!chunk.is_empty());
                prop_assert_eq!(chunk.start, next_start);
                next_start = chunk.end();
                got.extend(chunk.pairs());
            }
            prop_assert_eq!(next_start, to);
            prop_assert_eq!(got, expected);
        }
    }
}
