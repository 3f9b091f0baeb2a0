//! Error types for the pairwise kernel

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PairwiseError {
    #[error("Invalid element count: {n} (need at least 2, and at most u64::MAX pairs)")]
    InvalidSize { n: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Position {pos} outside pair space [0, {total})")]
    OutOfRange { pos: u64, total: u64 },

    #[error("Invalid pair ({row}, {col}) for {n} elements")]
    InvalidPair { row: usize, col: usize, n: usize },

    #[error("Feature vector {index} unavailable: {reason}")]
    FeatureUnavailable { index: usize, reason: String },

    #[error(
        "Worker {worker} failed on [{from_pos}, {to_pos}) \
         at chunk [{chunk_from}, {chunk_to}): {source}"
    )]
    TaskFailed {
        worker: usize,
        from_pos: u64,
        to_pos: u64,
        chunk_from: u64,
        chunk_to: u64,
        #[source]
        source: Box<PairwiseError>,
    },

    #[error("Incomplete run: {pending} task(s) unresolved, {failed} task(s) failed")]
    IncompleteRun { pending: usize, failed: usize },

    #[error("Relation returned {actual} values for a batch of {expected} pairs")]
    RelationMismatch { expected: usize, actual: usize },

    #[error("Partial output of worker {worker} is corrupt: {reason}")]
    CorruptPartial { worker: usize, reason: String },

    #[error("Record ({row}, {col}) appended after ({last_row}, {last_col})")]
    OutOfOrder {
        row: usize,
        col: usize,
        last_row: usize,
        last_col: usize,
    },

    #[error("Result store is closed")]
    StoreClosed,

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl PairwiseError {
    /// Innermost cause, looking through `TaskFailed` wrappers.
    pub fn root_cause(&self) -> &PairwiseError {
        match self {
            PairwiseError::TaskFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PairwiseError>;
