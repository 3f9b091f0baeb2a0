//! Worker tasks: one sub-range, driven chunk by chunk into a private sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info_span, warn};

use crate::chunks::ChunkIterator;
use crate::error::{PairwiseError, Result};
use crate::features::FeatureStore;
use crate::indexer::PairIndexer;
use crate::planner::SubRange;
use crate::relation::RelationEvaluator;
use crate::sink::{PairRecord, PartialOutput, SinkFactory};

/// Shared cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Timing profile of a completed task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskReport {
    pub range: SubRange,
    pub pairs: u64,
    pub chunks: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Completed {
        output: PartialOutput,
        report: TaskReport,
    },
    Failed {
        range: SubRange,
        error: PairwiseError,
    },
    Cancelled {
        range: SubRange,
    },
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn range(&self) -> &SubRange {
        match self {
            TaskOutcome::Completed { output, .. } => output.range(),
            TaskOutcome::Failed { range, .. } => range,
            TaskOutcome::Cancelled { range } => range,
        }
    }

    pub fn error(&self) -> Option<&PairwiseError> {
        match self {
            TaskOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Read-only collaborators a task needs. Shared by every task of a run.
pub struct TaskContext<'a> {
    pub indexer: PairIndexer,
    pub step_size: usize,
    pub evaluator: &'a RelationEvaluator,
    pub features: &'a dyn FeatureStore,
    pub sinks: &'a dyn SinkFactory,
    pub cancel: &'a CancelToken,
}

/// `Pending -> Running -> {Completed, Failed, Cancelled}`. No retries.
#[derive(Debug)]
pub struct WorkerTask {
    range: SubRange,
    status: TaskStatus,
}

impl WorkerTask {
    pub fn new(range: SubRange) -> Self {
        Self {
            range,
            status: TaskStatus::Pending,
        }
    }

    pub fn range(&self) -> &SubRange {
        &self.range
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn run(&mut self, ctx: &TaskContext<'_>) -> TaskOutcome {
        let range = self.range;
        let span = info_span!(
            "worker",
            worker = range.worker,
            from_pos = range.from_pos,
            to_pos = range.to_pos
        );
        let _enter = span.enter();

        self.status = TaskStatus::Running;
        let outcome = match self.drive(ctx) {
            Ok(Some((output, report))) => TaskOutcome::Completed { output, report },
            Ok(None) => {
                warn!("Task cancelled, partial output discarded");
                TaskOutcome::Cancelled { range }
            }
            Err(error) => {
                warn!(error = %error, "Task failed");
                TaskOutcome::Failed { range, error }
            }
        };
        self.status = outcome.status();
        outcome
    }

    /// `Ok(None)` means the run was cancelled mid-way.
    fn drive(&self, ctx: &TaskContext<'_>) -> Result<Option<(PartialOutput, TaskReport)>> {
        let range = self.range;
        let started = Instant::now();
        let chunks = ChunkIterator::new(ctx.indexer, range.from_pos, range.to_pos, ctx.step_size)
            .map_err(|e| self.failed(e, range.from_pos, range.from_pos))?;
        let mut sink = ctx
            .sinks
            .open(&range)
            .map_err(|e| self.failed(e, range.from_pos, range.from_pos))?;

        let mut records = Vec::with_capacity(ctx.step_size.min(range.len() as usize));
        let (mut pairs, mut chunk_count) = (0u64, 0u64);
        for chunk in chunks {
            if ctx.cancel.is_cancelled() {
                sink.abort();
                return Ok(None);
            }
            let written = ctx
                .evaluator
                .evaluate(&chunk, ctx.features)
                .and_then(|values| {
                    records.clear();
                    records.extend(
                        chunk
                            .pairs()
                            .zip(values)
                            .map(|((row, col), value)| PairRecord { row, col, value }),
                    );
                    sink.append(&records)
                });
            if let Err(e) = written {
                sink.abort();
                return Err(self.failed(e, chunk.start, chunk.end()));
            }
            debug!(chunk_from = chunk.start, pairs = chunk.len(), "Chunk evaluated");
            pairs += chunk.len() as u64;
            chunk_count += 1;
        }

        let output = sink
            .finish()
            .map_err(|e| self.failed(e, range.to_pos, range.to_pos))?;
        let report = TaskReport {
            range,
            pairs,
            chunks: chunk_count,
            elapsed: started.elapsed(),
        };
        debug!(pairs, chunks = chunk_count, digest = %output.digest_hex(), "Task completed");
        Ok(Some((output, report)))
    }

    fn failed(&self, error: PairwiseError, chunk_from: u64, chunk_to: u64) -> PairwiseError {
        PairwiseError::TaskFailed {
            worker: self.range.worker,
            from_pos: self.range.from_pos,
            to_pos: self.range.to_pos,
            chunk_from,
            chunk_to,
            source: Box::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DenseFeatures;
    use crate::relation::{Constant, DotProduct};
    use crate::sink::MemorySinks;
    use ndarray::Array2;

    fn drain(output: PartialOutput) -> Vec<PairRecord> {
        let mut got = Vec::new();
        output
            .drain(|b| {
                got.extend_from_slice(b);
                Ok(())
            })
            .unwrap();
        got
    }

    #[test]
    fn test_task_completes_range() {
        let features = DenseFeatures::new(Array2::ones((6, 3)));
        let evaluator = RelationEvaluator::new(Arc::new(DotProduct));
        let cancel = CancelToken::new();
        let ctx = TaskContext {
            indexer: PairIndexer::new(6).unwrap(),
            step_size: 4,
            evaluator: &evaluator,
            features: &features,
            sinks: &MemorySinks,
            cancel: &cancel,
        };
        let mut task = WorkerTask::new(SubRange { worker: 1, from_pos: 3, to_pos: 12 });
        assert_eq!(task.status(), TaskStatus::Pending);

        let outcome = task.run(&ctx);
        assert_eq!(task.status(), TaskStatus::Completed);
        match outcome {
            TaskOutcome::Completed { output, report } => {
                assert_eq!(report.pairs, 9);
                assert_eq!(report.chunks, 3);
                let records = drain(output);
                assert_eq!(records.len(), 9);
                assert_eq!(records[0].key(), (0, 4));
                assert_eq!(records[8].key(), (2, 5));
                assert!(records.iter().all(|r| r.value == 3.0));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_task_failure_carries_chunk_context() {
        // Only 4 feature rows for 6 elements: the chunk reaching index 4 fails.
        let features = DenseFeatures::new(Array2::zeros((4, 2)));
        let evaluator = RelationEvaluator::new(Arc::new(Constant(1.0)));
        let cancel = CancelToken::new();
        let ctx = TaskContext {
            indexer: PairIndexer::new(6).unwrap(),
            step_size: 2,
            evaluator: &evaluator,
            features: &features,
            sinks: &MemorySinks,
            cancel: &cancel,
        };
        let mut task = WorkerTask::new(SubRange { worker: 0, from_pos: 0, to_pos: 15 });
        let outcome = task.run(&ctx);
        assert_eq!(task.status(), TaskStatus::Failed);
        match outcome.error() {
            Some(PairwiseError::TaskFailed {
                worker: 0,
                chunk_from: 2,
                chunk_to: 4,
                source,
                ..
            }) => {
                assert!(matches!(**source, PairwiseError::FeatureUnavailable { index: 4, .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_task_produces_nothing() {
        let features = DenseFeatures::new(Array2::ones((5, 2)));
        let evaluator = RelationEvaluator::new(Arc::new(DotProduct));
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = TaskContext {
            indexer: PairIndexer::new(5).unwrap(),
            step_size: 3,
            evaluator: &evaluator,
            features: &features,
            sinks: &MemorySinks,
            cancel: &cancel,
        };
        let mut task = WorkerTask::new(SubRange { worker: 3, from_pos: 0, to_pos: 10 });
        let outcome = task.run(&ctx);
        assert_eq!(outcome.status(), TaskStatus::Cancelled);
        assert_eq!(outcome.range().worker, 3);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }
}
