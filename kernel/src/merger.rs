//! Ordered aggregation of partial outputs into the final result store

use std::mem;

use tracing::{info, warn};

use crate::error::{PairwiseError, Result};
use crate::planner::SubRange;
use crate::sink::PairRecord;
use crate::worker::{TaskOutcome, TaskStatus};

/// Ordered, append-only destination of a merged run.
pub trait RecordStore {
    /// Bulk append; records arrive in canonical pair order.
    fn append(&mut self, records: &[PairRecord]) -> Result<()>;

    /// Note a sub-range that was explicitly left out of the merge.
    fn skip(&mut self, _range: &SubRange) -> Result<()> {
        Ok(())
    }

    /// Freeze the store. Further appends fail.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeResult {
    pub source_idx: usize,
    pub target_idx: usize,
    pub score: f32,
}

/// In-memory final store with `(row, col)` lookups.
#[derive(Debug, Default)]
pub struct ResultStore {
    records: Vec<PairRecord>,
    gaps: Vec<SubRange>,
    closed: bool,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn records(&self) -> &[PairRecord] {
        &self.records
    }

    /// Sub-ranges excluded from the merge, in worker order.
    pub fn gaps(&self) -> &[SubRange] {
        &self.gaps
    }

    /// Value for the unordered pair `{a, b}`.
    pub fn get(&self, a: usize, b: usize) -> Option<f32> {
        let key = if a < b { (a, b) } else { (b, a) };
        self.records
            .binary_search_by_key(&key, PairRecord::key)
            .ok()
            .map(|i| self.records[i].value)
    }

    /// Records with `from <= (row, col) < to`.
    pub fn range(&self, from: (usize, usize), to: (usize, usize)) -> &[PairRecord] {
        let lo = self.records.partition_point(|r| r.key() < from);
        let hi = self.records.partition_point(|r| r.key() < to).max(lo);
        &self.records[lo..hi]
    }

    /// All stored pairs whose row is `row`.
    pub fn row(&self, row: usize) -> &[PairRecord] {
        self.range((row, 0), (row + 1, 0))
    }

    /// Pairs scoring strictly above `threshold`, in canonical order.
    pub fn edges_above(&self, threshold: f32) -> Vec<EdgeResult> {
        self.records
            .iter()
            .filter(|r| r.value > threshold)
            .map(|r| EdgeResult {
                source_idx: r.row,
                target_idx: r.col,
                score: r.value,
            })
            .collect()
    }
}

impl RecordStore for ResultStore {
    fn append(&mut self, records: &[PairRecord]) -> Result<()> {
        if self.closed {
            return Err(PairwiseError::StoreClosed);
        }
        let mut last = self.records.last().map(PairRecord::key);
        for record in records {
            if let Some((last_row, last_col)) = last {
                if record.key() <= (last_row, last_col) {
                    return Err(PairwiseError::OutOfOrder {
                        row: record.row,
                        col: record.col,
                        last_row,
                        last_col,
                    });
                }
            }
            last = Some(record.key());
        }
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn skip(&mut self, range: &SubRange) -> Result<()> {
        if self.closed {
            return Err(PairwiseError::StoreClosed);
        }
        self.gaps.push(*range);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Resolved(TaskOutcome),
    Excluded,
    Merged,
}

/// Totals of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub records: u64,
    pub merged_workers: usize,
    pub excluded: Vec<SubRange>,
}

/// Collects task outcomes and appends them in worker-index order.
///
/// Outcomes may be submitted in any order. Failed or cancelled tasks can be
/// re-submitted after a retry, or excluded explicitly; the merge refuses to
/// run while any worker is unresolved or failed.
#[derive(Debug)]
pub struct ResultMerger {
    plan: Vec<SubRange>,
    slots: Vec<Slot>,
    /// Key of the last record the store accepted.
    last_key: Option<(usize, usize)>,
}

impl ResultMerger {
    pub fn new(plan: Vec<SubRange>) -> Self {
        let slots = plan.iter().map(|_| Slot::Pending).collect();
        Self {
            plan,
            slots,
            last_key: None,
        }
    }

    pub fn plan(&self) -> &[SubRange] {
        &self.plan
    }

    /// Record a task outcome. A completed worker cannot be replaced.
    pub fn submit(&mut self, outcome: TaskOutcome) -> Result<()> {
        let range = *outcome.range();
        let worker = range.worker;
        if self.plan.get(worker) != Some(&range) {
            return Err(PairwiseError::InvalidConfig(format!(
                "outcome for worker {} does not match the plan",
                worker
            )));
        }
        let taken = match &self.slots[worker] {
            Slot::Resolved(prev) => prev.status() == TaskStatus::Completed,
            Slot::Merged => true,
            Slot::Pending | Slot::Excluded => false,
        };
        if taken {
            return Err(PairwiseError::InvalidConfig(format!(
                "worker {} already completed",
                worker
            )));
        }
        self.slots[worker] = Slot::Resolved(outcome);
        Ok(())
    }

    /// Leave `worker`'s sub-range out of the merge.
    pub fn exclude(&mut self, worker: usize) -> Result<()> {
        let slot = self.slots.get_mut(worker).ok_or_else(|| {
            PairwiseError::InvalidConfig(format!("no worker {} in plan", worker))
        })?;
        if matches!(slot, Slot::Merged) {
            return Err(PairwiseError::InvalidConfig(format!(
                "worker {} already merged",
                worker
            )));
        }
        if let Slot::Resolved(TaskOutcome::Completed { output, .. }) =
            mem::replace(slot, Slot::Excluded)
        {
            output.discard();
        }
        Ok(())
    }

    /// Current state of `worker`. Excluded workers report `Pending`.
    pub fn status(&self, worker: usize) -> Option<TaskStatus> {
        self.slots.get(worker).map(|slot| match slot {
            Slot::Resolved(outcome) => outcome.status(),
            Slot::Merged => TaskStatus::Completed,
            Slot::Pending | Slot::Excluded => TaskStatus::Pending,
        })
    }

    /// Sub-ranges whose task failed or was cancelled.
    pub fn failed_ranges(&self) -> Vec<SubRange> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Resolved(o) if o.status() != TaskStatus::Completed => Some(*o.range()),
                _ => None,
            })
            .collect()
    }

    /// First recorded task error, in worker order.
    pub fn first_error(&self) -> Option<&PairwiseError> {
        self.slots.iter().find_map(|slot| match slot {
            Slot::Resolved(o) => o.error(),
            _ => None,
        })
    }

    /// Hand back the first failure's error, leaving the slot pending.
    pub(crate) fn take_first_error(&mut self) -> Option<PairwiseError> {
        let worker = self.slots.iter().position(|slot| {
            matches!(slot, Slot::Resolved(TaskOutcome::Failed { .. }))
        })?;
        match mem::replace(&mut self.slots[worker], Slot::Pending) {
            Slot::Resolved(TaskOutcome::Failed { error, .. }) => Some(error),
            other => {
                self.slots[worker] = other;
                None
            }
        }
    }

    /// Release every completed partial without merging it.
    pub fn discard_completed(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Resolved(TaskOutcome::Completed { output, .. }) =
                mem::replace(slot, Slot::Pending)
            {
                output.discard();
            }
        }
    }

    /// Append every completed partial to `store` in worker order, then close it.
    ///
    /// A worker is marked merged only once its records are in the store, so a
    /// merge interrupted by a store error resumes at the first unmerged worker.
    /// The summary covers the workers merged by this call.
    pub fn merge(&mut self, store: &mut dyn RecordStore) -> Result<MergeSummary> {
        if self.slots.iter().all(|slot| matches!(slot, Slot::Merged)) {
            return Err(PairwiseError::InvalidConfig("run already merged".to_string()));
        }
        let mut pending = 0;
        let mut failed = 0;
        for slot in &self.slots {
            match slot {
                Slot::Pending => pending += 1,
                Slot::Resolved(o) if o.status() != TaskStatus::Completed => failed += 1,
                _ => {}
            }
        }
        if pending > 0 || failed > 0 {
            warn!(pending, failed, "Refusing to merge incomplete run");
            return Err(PairwiseError::IncompleteRun { pending, failed });
        }

        // Validate everything before the first append so a bad partial never
        // leaves the store half-written.
        for slot in &self.slots {
            if let Slot::Resolved(TaskOutcome::Completed { output, .. }) = slot {
                let range = output.range();
                if output.records() != range.len() {
                    return Err(PairwiseError::CorruptPartial {
                        worker: range.worker,
                        reason: format!(
                            "holds {} records for a range of {}",
                            output.records(),
                            range.len()
                        ),
                    });
                }
                output.verify()?;
            }
        }

        let mut summary = MergeSummary {
            records: 0,
            merged_workers: 0,
            excluded: Vec::new(),
        };
        let last_key = &mut self.last_key;
        for (worker, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Slot::Resolved(TaskOutcome::Completed { output, .. }) => {
                    output.replay(|batch| {
                        // Skip what an interrupted merge already appended.
                        let start = last_key.map_or(0, |k| batch.partition_point(|r| r.key() <= k));
                        let fresh = &batch[start..];
                        if let Some(last) = fresh.last() {
                            store.append(fresh)?;
                            *last_key = Some(last.key());
                        }
                        Ok(())
                    })?;
                    summary.records += output.records();
                    summary.merged_workers += 1;
                }
                Slot::Excluded => {
                    store.skip(&self.plan[worker])?;
                    summary.excluded.push(self.plan[worker]);
                }
                _ => continue,
            }
            if let Slot::Resolved(TaskOutcome::Completed { output, .. }) =
                mem::replace(slot, Slot::Merged)
            {
                output.discard();
            }
        }
        store.close()?;
        info!(
            records = summary.records,
            workers = summary.merged_workers,
            excluded = summary.excluded.len(),
            "Merged partial outputs"
        );
        Ok(summary)
    }
}
