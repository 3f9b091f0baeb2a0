//! Pairwise Kernel - out-of-core all-pairs relation engine
//!
//! Computes a relation for every unordered pair of a large element set:
//! - Pair-space indexing and fixed-size chunking (bounded memory per worker)
//! - Linear partitioning of pair space across a rayon pool
//! - Task-private partial outputs merged in deterministic worker order

pub mod chunks;
pub mod config;
pub mod elements;
pub mod engine;
pub mod error;
pub mod features;
pub mod indexer;
pub mod merger;
pub mod planner;
pub mod relation;
pub mod sink;
pub mod worker;

#[cfg(feature = "python")]
mod bindings;

pub use chunks::{Chunk, ChunkIterator};
pub use config::EngineConfig;
pub use elements::ElementSet;
pub use engine::{Execution, PairwiseEngine, RunReport};
pub use error::{PairwiseError, Result};
pub use features::{standardize_rows, write_features, DenseFeatures, FeatureStore, MmapFeatures};
pub use indexer::{pair_count, PairIndexer, PairRange};
pub use merger::{EdgeResult, MergeSummary, RecordStore, ResultMerger, ResultStore};
pub use planner::{plan, plan_total, SubRange};
pub use relation::{
    Constant, Cosine, DotProduct, PairFn, Pearson, Relation, RelationEvaluator, RelationKind,
};
pub use sink::{FileSinks, MemorySinks, PairRecord, PartialOutput, PartialSink, SinkFactory};
pub use worker::{CancelToken, TaskOutcome, TaskReport, TaskStatus, WorkerTask};
