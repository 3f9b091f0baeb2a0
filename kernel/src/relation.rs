//! Pluggable pairwise relations and the chunk evaluator
//!
//! A [`Relation`] sees two aligned batches: row `k` of `s` is paired with row
//! `k` of `t`. Built-ins reduce over the feature axis for the whole batch at
//! once; [`PairFn`] adapts a pair-at-a-time closure.

use std::sync::Arc;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::chunks::Chunk;
use crate::error::{PairwiseError, Result};
use crate::features::FeatureStore;

/// Stateless batched pairwise function.
pub trait Relation: Send + Sync {
    fn name(&self) -> &str;

    /// One value per aligned row pair.
    fn evaluate(&self, s: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32>;
}

/// Plain dot product. On standardized rows this is Pearson's r.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProduct;

impl Relation for DotProduct {
    fn name(&self) -> &str {
        "dot"
    }

    fn evaluate(&self, s: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32> {
        (&s * &t).sum_axis(Axis(1))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Relation for Cosine {
    fn name(&self) -> &str {
        "cosine"
    }

    fn evaluate(&self, s: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32> {
        let dots = (&s * &t).sum_axis(Axis(1));
        let ns = s.mapv(|x| x * x).sum_axis(Axis(1));
        let nt = t.mapv(|x| x * x).sum_axis(Axis(1));
        Zip::from(&dots)
            .and(&ns)
            .and(&nt)
            .map_collect(|&d, &a, &b| {
                let denom = (a * b).sqrt();
                if denom > 0.0 {
                    d / denom
                } else {
                    0.0
                }
            })
    }
}

/// Pearson correlation on raw (unstandardized) rows.
/// Zero-variance rows correlate as 0.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pearson;

impl Relation for Pearson {
    fn name(&self) -> &str {
        "pearson"
    }

    fn evaluate(&self, s: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32> {
        let dim = s.ncols().max(1) as f32;
        let ms = s.sum_axis(Axis(1)) / dim;
        let mt = t.sum_axis(Axis(1)) / dim;
        let cs = &s - &ms.insert_axis(Axis(1));
        let ct = &t - &mt.insert_axis(Axis(1));
        Cosine.evaluate(cs.view(), ct.view())
    }
}

/// Same value for every pair.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub f32);

impl Relation for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    fn evaluate(&self, s: ArrayView2<'_, f32>, _t: ArrayView2<'_, f32>) -> Array1<f32> {
        Array1::from_elem(s.nrows(), self.0)
    }
}

/// Adapter for a closure evaluated one pair at a time.
pub struct PairFn<F> {
    name: String,
    f: F,
}

impl<F> PairFn<F>
where
    F: Fn(ArrayView1<'_, f32>, ArrayView1<'_, f32>) -> f32 + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Relation for PairFn<F>
where
    F: Fn(ArrayView1<'_, f32>, ArrayView1<'_, f32>) -> f32 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, s: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32> {
        s.outer_iter()
            .zip(t.outer_iter())
            .map(|(a, b)| (self.f)(a, b))
            .collect()
    }
}

/// Serializable name of a built-in relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    #[default]
    Dot,
    Cosine,
    Pearson,
}

impl RelationKind {
    pub fn build(self) -> Arc<dyn Relation> {
        match self {
            RelationKind::Dot => Arc::new(DotProduct),
            RelationKind::Cosine => Arc::new(Cosine),
            RelationKind::Pearson => Arc::new(Pearson),
        }
    }
}

impl std::str::FromStr for RelationKind {
    type Err = PairwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dot" => Ok(RelationKind::Dot),
            "cosine" => Ok(RelationKind::Cosine),
            "pearson" => Ok(RelationKind::Pearson),
            other => Err(PairwiseError::InvalidConfig(format!(
                "unknown relation '{}'",
                other
            ))),
        }
    }
}

/// Applies a [`Relation`] to chunks, fetching only the vectors they touch.
#[derive(Clone)]
pub struct RelationEvaluator {
    relation: Arc<dyn Relation>,
}

impl RelationEvaluator {
    pub fn new(relation: Arc<dyn Relation>) -> Self {
        Self { relation }
    }

    pub fn relation_name(&self) -> &str {
        self.relation.name()
    }

    /// Values aligned 1:1 with `chunk.pairs()`. Either every value is
    /// produced or an error is returned.
    pub fn evaluate(&self, chunk: &Chunk, features: &dyn FeatureStore) -> Result<Vec<f32>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        // Distinct indices touched by this chunk, each fetched once.
        let mut working_set: Vec<usize> = chunk.rows.iter().chain(&chunk.cols).copied().collect();
        working_set.sort_unstable();
        working_set.dedup();
        let block = features.feature_vectors(&working_set)?;

        let slot = |index: &usize| working_set.binary_search(index).unwrap_or_default();
        let row_slots: Vec<usize> = chunk.rows.iter().map(slot).collect();
        let col_slots: Vec<usize> = chunk.cols.iter().map(slot).collect();
        let s = block.select(Axis(0), &row_slots);
        let t = block.select(Axis(0), &col_slots);

        // Logical order, whatever the layout the relation handed back.
        let values: Vec<f32> = self
            .relation
            .evaluate(s.view(), t.view())
            .iter()
            .copied()
            .collect();
        if values.len() != chunk.len() {
            return Err(PairwiseError::RelationMismatch {
                expected: chunk.len(),
                actual: values.len(),
            });
        }
        Ok(values)
    }
}

impl std::fmt::Debug for RelationEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationEvaluator")
            .field("relation", &self.relation.name())
            .finish()
    }
}
