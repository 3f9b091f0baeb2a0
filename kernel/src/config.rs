//! Run configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PairwiseError, Result};
use crate::relation::RelationKind;

/// Default maximum pairs per chunk.
pub const DEFAULT_STEP_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum pairs per chunk; bounds resident feature data per worker.
    pub step_size: usize,
    /// Number of sub-ranges and pool threads.
    pub worker_count: usize,
    /// Optional explicit start of the position range.
    pub from_pos: Option<u64>,
    /// Optional explicit end (exclusive) of the position range.
    pub to_pos: Option<u64>,
    /// Built-in relation used when none is supplied directly.
    pub relation: RelationKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_size: DEFAULT_STEP_SIZE,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            from_pos: None,
            to_pos: None,
            relation: RelationKind::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn with_step_size(mut self, step_size: usize) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_range(mut self, from_pos: u64, to_pos: u64) -> Self {
        self.from_pos = Some(from_pos);
        self.to_pos = Some(to_pos);
        self
    }

    pub fn with_relation(mut self, relation: RelationKind) -> Self {
        self.relation = relation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_size == 0 {
            return Err(PairwiseError::InvalidConfig(
                "step_size must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(PairwiseError::InvalidConfig(
                "worker_count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective `[from_pos, to_pos)` inside a pair space of `total` pairs.
    pub fn resolve_range(&self, total: u64) -> Result<(u64, u64)> {
        let from = self.from_pos.unwrap_or(0);
        let to = self.to_pos.unwrap_or(total);
        if to > total {
            return Err(PairwiseError::OutOfRange { pos: to, total });
        }
        if from > to {
            return Err(PairwiseError::OutOfRange { pos: from, total });
        }
        Ok((from, to))
    }
}
