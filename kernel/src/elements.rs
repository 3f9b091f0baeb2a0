//! Element set: the ordered, immutable population whose pairs are related

use std::collections::HashMap;

use crate::error::{PairwiseError, Result};
use crate::indexer::PairIndexer;

#[derive(Debug, Clone)]
pub struct ElementSet {
    indexer: PairIndexer,
    ids: Option<Vec<String>>,
    lookup: HashMap<String, usize>,
}

impl ElementSet {
    /// Anonymous elements `0..len`.
    pub fn with_len(len: usize) -> Result<Self> {
        Ok(Self {
            indexer: PairIndexer::new(len)?,
            ids: None,
            lookup: HashMap::new(),
        })
    }

    /// Named elements; position in `ids` is the element index.
    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let indexer = PairIndexer::new(ids.len())?;
        let mut lookup = HashMap::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if lookup.insert(id.clone(), index).is_some() {
                return Err(PairwiseError::InvalidConfig(format!(
                    "duplicate element id '{}'",
                    id
                )));
            }
        }
        Ok(Self {
            indexer,
            ids: Some(ids),
            lookup,
        })
    }

    pub fn len(&self) -> usize {
        self.indexer.n()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indexer(&self) -> PairIndexer {
        self.indexer
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.lookup.get(id).copied()
    }

    /// Identifier of `index`; anonymous sets use the decimal index.
    pub fn id_of(&self, index: usize) -> Option<String> {
        if index >= self.len() {
            return None;
        }
        match &self.ids {
            Some(ids) => ids.get(index).cloned(),
            None => Some(index.to_string()),
        }
    }

    /// Canonical `(row, col)` for two identifiers, in either order.
    pub fn pair_of(&self, a: &str, b: &str) -> Option<(usize, usize)> {
        let (i, j) = (self.index_of(a)?, self.index_of(b)?);
        match i.cmp(&j) {
            std::cmp::Ordering::Less => Some((i, j)),
            std::cmp::Ordering::Greater => Some((j, i)),
            std::cmp::Ordering::Equal => None,
        }
    }
}
