//! Orchestration: plan, dispatch to a rayon pool, collect, merge
//!
//! ```text
//! plan ──> [SubRange 0] ──> WorkerTask ──> sink 0 ─┐
//!      ──> [SubRange 1] ──> WorkerTask ──> sink 1 ─┼─> ResultMerger ──> store
//!      ──> [SubRange k] ──> WorkerTask ──> sink k ─┘   (worker order)
//! ```
//!
//! Configuration and sizes are validated before anything is dispatched.
//! Tasks share only read-only collaborators; each owns its sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{PairwiseError, Result};
use crate::features::FeatureStore;
use crate::indexer::PairIndexer;
use crate::merger::{MergeSummary, RecordStore, ResultMerger};
use crate::planner::{self, SubRange};
use crate::relation::{Relation, RelationEvaluator};
use crate::sink::SinkFactory;
use crate::worker::{CancelToken, TaskContext, TaskOutcome, TaskReport, TaskStatus, WorkerTask};

/// Profile of a finished, merged run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub relation: String,
    pub total_pairs: u64,
    pub tasks: Vec<TaskReport>,
    pub merge: MergeSummary,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn pairs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.merge.records as f64 / secs
        } else {
            0.0
        }
    }
}

/// Outcomes of one dispatch, not yet merged.
#[derive(Debug)]
pub struct Execution {
    merger: ResultMerger,
    reports: Vec<TaskReport>,
    started: Instant,
    cancelled: bool,
}

impl Execution {
    pub fn merger(&self) -> &ResultMerger {
        &self.merger
    }

    pub fn merger_mut(&mut self) -> &mut ResultMerger {
        &mut self.merger
    }

    pub fn reports(&self) -> &[TaskReport] {
        &self.reports
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn failed_ranges(&self) -> Vec<SubRange> {
        self.merger.failed_ranges()
    }

    /// Whether every planned worker completed.
    pub fn all_completed(&self) -> bool {
        (0..self.merger.plan().len())
            .all(|w| self.merger.status(w) == Some(TaskStatus::Completed))
    }

    /// Re-dispatch every failed or cancelled sub-range once, sequentially.
    /// Returns how many are still failing.
    pub fn retry_failed(
        &mut self,
        engine: &PairwiseEngine,
        sinks: &dyn SinkFactory,
    ) -> Result<usize> {
        let cancel = CancelToken::new();
        let mut still_failing = 0;
        for range in self.merger.failed_ranges() {
            info!(worker = range.worker, "Retrying sub-range");
            let outcome = engine.run_task(range, sinks, &cancel);
            if let TaskOutcome::Completed { report, .. } = &outcome {
                self.reports.push(*report);
            } else {
                still_failing += 1;
            }
            self.merger.submit(outcome)?;
        }
        self.cancelled = false;
        Ok(still_failing)
    }

    /// Merge into `store`. Fails with `IncompleteRun` while any task is
    /// unresolved or failed and nothing is excluded in its place. A cancelled
    /// execution releases its completed partials and merges nothing.
    pub fn finish(
        mut self,
        engine: &PairwiseEngine,
        store: &mut dyn RecordStore,
    ) -> Result<RunReport> {
        if self.cancelled {
            self.merger.discard_completed();
            return Err(PairwiseError::Cancelled);
        }
        let merge = self.merger.merge(store)?;
        self.reports.sort_by_key(|r| r.range.worker);
        Ok(RunReport {
            relation: engine.evaluator.relation_name().to_string(),
            total_pairs: engine.indexer.total(),
            tasks: self.reports,
            merge,
            elapsed: self.started.elapsed(),
        })
    }
}

/// Out-of-core all-pairs engine over a fixed feature store.
pub struct PairwiseEngine {
    config: EngineConfig,
    indexer: PairIndexer,
    evaluator: RelationEvaluator,
    features: Arc<dyn FeatureStore>,
}

impl PairwiseEngine {
    pub fn new(
        config: EngineConfig,
        features: Arc<dyn FeatureStore>,
        relation: Arc<dyn Relation>,
    ) -> Result<Self> {
        config.validate()?;
        let indexer = PairIndexer::new(features.len())?;
        config.resolve_range(indexer.total())?;
        Ok(Self {
            config,
            indexer,
            evaluator: RelationEvaluator::new(relation),
            features,
        })
    }

    /// Engine using the configured built-in relation.
    pub fn from_config(config: EngineConfig, features: Arc<dyn FeatureStore>) -> Result<Self> {
        let relation = config.relation.build();
        Self::new(config, features, relation)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn indexer(&self) -> PairIndexer {
        self.indexer
    }

    /// Worker sub-ranges for the configured position range.
    pub fn plan(&self) -> Result<Vec<SubRange>> {
        let (from, to) = self.config.resolve_range(self.indexer.total())?;
        planner::plan(from, to, self.config.worker_count)
    }

    /// Run one sub-range on the calling thread.
    pub fn run_task(
        &self,
        range: SubRange,
        sinks: &dyn SinkFactory,
        cancel: &CancelToken,
    ) -> TaskOutcome {
        let ctx = self.context(sinks, cancel);
        WorkerTask::new(range).run(&ctx)
    }

    /// Dispatch every planned sub-range to a pool of `worker_count` threads
    /// and wait for all of them.
    pub fn execute(&self, sinks: &dyn SinkFactory, cancel: &CancelToken) -> Result<Execution> {
        let started = Instant::now();
        let plan = self.plan()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_count)
            .thread_name(|i| format!("pairwise-worker-{}", i))
            .build()?;

        info!(
            n = self.indexer.n(),
            pairs = plan.iter().map(SubRange::len).sum::<u64>(),
            workers = plan.len(),
            step_size = self.config.step_size,
            relation = self.evaluator.relation_name(),
            "Starting pairwise run"
        );

        let ctx = self.context(sinks, cancel);
        let outcomes: Vec<TaskOutcome> = pool.install(|| {
            plan.par_iter()
                .map(|range| WorkerTask::new(*range).run(&ctx))
                .collect()
        });

        let mut merger = ResultMerger::new(plan);
        let mut reports = Vec::new();
        let mut cancelled = cancel.is_cancelled();
        for outcome in outcomes {
            match &outcome {
                TaskOutcome::Completed { report, .. } => reports.push(*report),
                TaskOutcome::Cancelled { .. } => cancelled = true,
                TaskOutcome::Failed { .. } => {}
            }
            merger.submit(outcome)?;
        }

        let failed = merger.failed_ranges().len();
        info!(
            completed = reports.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );
        Ok(Execution {
            merger,
            reports,
            started,
            cancelled,
        })
    }

    /// Execute and merge in one step. The first task failure is returned as
    /// `TaskFailed`; partials of the tasks that completed are left in place
    /// (files stay on disk) and the failed sub-range can be re-run with
    /// [`run_task`](Self::run_task). A cancelled run returns `Cancelled`,
    /// discards every partial and merges nothing.
    pub fn run(
        &self,
        sinks: &dyn SinkFactory,
        store: &mut dyn RecordStore,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let mut execution = self.execute(sinks, cancel)?;
        if execution.is_cancelled() {
            warn!("Run cancelled before merge");
            execution.merger.discard_completed();
            return Err(PairwiseError::Cancelled);
        }
        if let Some(error) = execution.merger.take_first_error() {
            return Err(error);
        }
        let report = execution.finish(self, store)?;
        info!(
            records = report.merge.records,
            elapsed_ms = report.elapsed.as_millis() as u64,
            pairs_per_sec = report.pairs_per_second() as u64,
            "Pairwise run complete"
        );
        Ok(report)
    }

    fn context<'a>(
        &'a self,
        sinks: &'a dyn SinkFactory,
        cancel: &'a CancelToken,
    ) -> TaskContext<'a> {
        TaskContext {
            indexer: self.indexer,
            step_size: self.config.step_size,
            evaluator: &self.evaluator,
            features: self.features.as_ref(),
            sinks,
            cancel,
        }
    }
}

impl std::fmt::Debug for PairwiseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwiseEngine")
            .field("config", &self.config)
            .field("n", &self.indexer.n())
            .field("relation", &self.evaluator.relation_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DenseFeatures;
    use crate::merger::ResultStore;
    use crate::relation::{Constant, DotProduct};
    use crate::sink::MemorySinks;
    use ndarray::Array2;

    fn engine(n: usize, step: usize, workers: usize) -> PairwiseEngine {
        let features = Arc::new(DenseFeatures::new(Array2::ones((n, 2))));
        let config = EngineConfig::default()
            .with_step_size(step)
            .with_worker_count(workers);
        PairwiseEngine::new(config, features, Arc::new(DotProduct)).unwrap()
    }

    #[test]
    fn test_validation_before_dispatch() {
        let features: Arc<dyn FeatureStore> = Arc::new(DenseFeatures::new(Array2::ones((1, 2))));
        assert!(matches!(
            PairwiseEngine::new(EngineConfig::default(), features, Arc::new(Constant(0.0))),
            Err(PairwiseError::InvalidSize { n: 1 })
        ));

        let features: Arc<dyn FeatureStore> = Arc::new(DenseFeatures::new(Array2::ones((4, 2))));
        let zero_step = EngineConfig::default().with_step_size(0);
        assert!(matches!(
            PairwiseEngine::new(zero_step, features.clone(), Arc::new(Constant(0.0))),
            Err(PairwiseError::InvalidConfig(_))
        ));
        let bad_range = EngineConfig::default().with_range(0, 7);
        assert!(matches!(
            PairwiseEngine::new(bad_range, features, Arc::new(Constant(0.0))),
            Err(PairwiseError::OutOfRange { pos: 7, total: 6 })
        ));
    }

    #[test]
    fn test_plan_n4() {
        let plan = engine(4, 2, 2).plan().unwrap();
        let bounds: Vec<_> = plan.iter().map(|r| (r.from_pos, r.to_pos)).collect();
        assert_eq!(bounds, vec![(0, 3), (3, 6)]);
    }

    #[test]
    fn test_run_small() {
        let engine = engine(10, 4, 3);
        let mut store = ResultStore::new();
        let report = engine
            .run(&MemorySinks, &mut store, &CancelToken::new())
            .unwrap();
        assert_eq!(report.total_pairs, 45);
        assert_eq!(report.merge.records, 45);
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(report.relation, "dot");
        assert_eq!(store.len(), 45);
        assert!(store.records().iter().all(|r| r.value == 2.0));
    }

    #[test]
    fn test_explicit_subrange() {
        let features = Arc::new(DenseFeatures::new(Array2::ones((10, 2))));
        let config = EngineConfig::default()
            .with_step_size(3)
            .with_worker_count(2)
            .with_range(9, 20);
        let engine = PairwiseEngine::new(config, features, Arc::new(Constant(1.0))).unwrap();
        let mut store = ResultStore::new();
        engine.run(&MemorySinks, &mut store, &CancelToken::new()).unwrap();
        assert_eq!(store.len(), 11);
        assert_eq!(store.records()[0].key(), (1, 2));
    }

    #[test]
    fn test_cancelled_run_never_merges() {
        let engine = engine(20, 5, 2);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut store = ResultStore::new();
        assert!(matches!(
            engine.run(&MemorySinks, &mut store, &cancel),
            Err(PairwiseError::Cancelled)
        ));
        assert!(store.is_empty());
        assert!(!store.is_closed());
    }

    #[test]
    fn test_more_workers_than_pairs() {
        let engine = engine(3, 2, 8);
        let execution = engine.execute(&MemorySinks, &CancelToken::new()).unwrap();
        assert!(execution.all_completed());
        let mut store = ResultStore::new();
        let report = execution.finish(&engine, &mut store).unwrap();
        assert_eq!(report.merge.records, 3);
        assert_eq!(report.tasks.len(), 8);
    }
}
