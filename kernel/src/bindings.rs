//! Python Bindings for Pairwise Kernel

use std::sync::Arc;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::{EngineConfig, DEFAULT_STEP_SIZE};
use crate::engine::PairwiseEngine;
use crate::error::PairwiseError;
use crate::features::DenseFeatures;
use crate::indexer::PairIndexer;
use crate::merger::ResultStore;
use crate::relation::RelationKind;
use crate::sink::MemorySinks;
use crate::worker::CancelToken;

fn to_py_err(e: PairwiseError) -> PyErr {
    match e {
        PairwiseError::InvalidSize { .. }
        | PairwiseError::InvalidConfig(_)
        | PairwiseError::OutOfRange { .. }
        | PairwiseError::InvalidPair { .. } => PyValueError::new_err(e.to_string()),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn run_dense(
    features: DenseFeatures,
    relation: RelationKind,
    step_size: usize,
    worker_count: Option<usize>,
) -> Result<ResultStore, PairwiseError> {
    let mut config = EngineConfig::default()
        .with_step_size(step_size)
        .with_relation(relation);
    if let Some(workers) = worker_count {
        config = config.with_worker_count(workers);
    }
    let engine = PairwiseEngine::from_config(config, Arc::new(features))?;
    let mut store = ResultStore::new();
    engine.run(&MemorySinks, &mut store, &CancelToken::new())?;
    Ok(store)
}

// ============================================================================
// PAIR SPACE
// ============================================================================

/// Number of unordered pairs over n elements
#[pyfunction]
fn pair_count(n: usize) -> PyResult<u64> {
    crate::indexer::pair_count(n).map_err(to_py_err)
}

/// (row, col) at a canonical pair-space position
#[pyfunction]
fn position_to_pair(pos: u64, n: usize) -> PyResult<(usize, usize)> {
    PairIndexer::new(n)
        .and_then(|idx| idx.position_to_pair(pos))
        .map_err(to_py_err)
}

// ============================================================================
// ALL-PAIRS RELATIONS
// ============================================================================

/// Every pair with its relation value, in canonical order
#[pyfunction]
#[pyo3(signature = (vectors, relation = "dot", step_size = DEFAULT_STEP_SIZE, worker_count = None))]
fn pairwise_all(
    py: Python<'_>,
    vectors: Vec<Vec<f32>>,
    relation: &str,
    step_size: usize,
    worker_count: Option<usize>,
) -> PyResult<Vec<(usize, usize, f32)>> {
    let relation: RelationKind = relation.parse().map_err(to_py_err)?;
    let features = DenseFeatures::from_rows(vectors).map_err(to_py_err)?;
    let store = py
        .allow_threads(|| run_dense(features, relation, step_size, worker_count))
        .map_err(to_py_err)?;
    Ok(store.records().iter().map(|r| (r.row, r.col, r.value)).collect())
}

/// Pearson-correlated pairs above a threshold
#[pyfunction]
#[pyo3(signature = (vectors, threshold, step_size = DEFAULT_STEP_SIZE, worker_count = None))]
fn correlate_above(
    py: Python<'_>,
    vectors: Vec<Vec<f32>>,
    threshold: f32,
    step_size: usize,
    worker_count: Option<usize>,
) -> PyResult<Vec<(usize, usize, f32)>> {
    let features = DenseFeatures::from_rows(vectors)
        .map_err(to_py_err)?
        .standardized();
    let store = py
        .allow_threads(|| run_dense(features, RelationKind::Dot, step_size, worker_count))
        .map_err(to_py_err)?;
    Ok(store
        .edges_above(threshold)
        .into_iter()
        .map(|e| (e.source_idx, e.target_idx, e.score))
        .collect())
}

// ============================================================================
// MODULE EXPORT
// ============================================================================

#[pymodule]
fn pairwise_kernel(_py: Python, m: &PyModule) -> PyResult<()> {
    // Pair space
    m.add_function(wrap_pyfunction!(pair_count, m)?)?;
    m.add_function(wrap_pyfunction!(position_to_pair, m)?)?;
    // Relations
    m.add_function(wrap_pyfunction!(pairwise_all, m)?)?;
    m.add_function(wrap_pyfunction!(correlate_above, m)?)?;
    Ok(())
}
