//! Workload partitioning over pair space

use crate::error::{PairwiseError, Result};

/// Half-open slice of pair space owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubRange {
    pub worker: usize,
    pub from_pos: u64,
    pub to_pos: u64,
}

impl SubRange {
    pub fn len(&self) -> u64 {
        self.to_pos - self.from_pos
    }

    pub fn is_empty(&self) -> bool {
        self.from_pos == self.to_pos
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.from_pos && pos < self.to_pos
    }
}

/// Splits a position range into `workers` contiguous, balanced sub-ranges.
///
/// Split `k` sits at `from + floor(k * len / workers)`, so sizes differ by
/// at most one pair and the plan is identical on every run.
pub fn plan(from_pos: u64, to_pos: u64, workers: usize) -> Result<Vec<SubRange>> {
    if workers == 0 {
        return Err(PairwiseError::InvalidConfig(
            "worker_count must be positive".to_string(),
        ));
    }
    if from_pos > to_pos {
        return Err(PairwiseError::OutOfRange {
            pos: from_pos,
            total: to_pos,
        });
    }
    let len = (to_pos - from_pos) as u128;
    let w = workers as u128;
    let split = |k: usize| from_pos + ((k as u128 * len) / w) as u64;

    Ok((0..workers)
        .map(|k| SubRange {
            worker: k,
            from_pos: split(k),
            to_pos: split(k + 1),
        })
        .collect())
}

/// Plan over the whole pair space `[0, total)`.
pub fn plan_total(total: u64, workers: usize) -> Result<Vec<SubRange>> {
    plan(0, total, workers)
}
