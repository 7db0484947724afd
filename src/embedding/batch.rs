//! Lookup request in EmbeddingBag (indices + offsets) form

use crate::errors::{FleetError, Result};

/// Indices and bag offsets for one embedding table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddingInput {
    /// Row indices, `indices_len` entries
    pub indices: Vec<u32>,

    /// Start of each bag in `indices`; the last bag ends at `indices_len`
    pub offsets: Vec<u32>,
}

impl EmbeddingInput {
    pub fn new(indices: Vec<u32>, offsets: Vec<u32>) -> Self {
        Self { indices, offsets }
    }

    pub fn indices_len(&self) -> usize {
        self.indices.len()
    }

    pub fn nr_batches(&self) -> usize {
        self.offsets.len()
    }

    /// Index range of one bag
    pub fn bag(&self, bag: usize) -> std::ops::Range<usize> {
        let start = self.offsets[bag] as usize;
        let end = match self.offsets.get(bag + 1) {
            Some(&next) => next as usize,
            None => self.indices.len(),
        };
        start..end
    }

    pub(crate) fn validate(&self, embedding: usize, nr_rows: usize) -> Result<()> {
        if let Some(&first) = self.offsets.first() {
            if first != 0 {
                return Err(FleetError::InvalidBatch(format!(
                    "embedding {}: offsets[0] is {}, expected 0",
                    embedding, first
                )));
            }
        }
        if let Some(pos) = self.offsets.windows(2).position(|w| w[1] < w[0]) {
            return Err(FleetError::InvalidBatch(format!(
                "embedding {}: offsets decrease at bag {}",
                embedding,
                pos + 1
            )));
        }
        if let Some(&last) = self.offsets.last() {
            if last as usize > self.indices.len() {
                return Err(FleetError::InvalidBatch(format!(
                    "embedding {}: last offset {} past indices_len {}",
                    embedding,
                    last,
                    self.indices.len()
                )));
            }
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= nr_rows) {
            return Err(FleetError::InvalidBatch(format!(
                "embedding {}: index {} out of range for {} rows",
                embedding, index, nr_rows
            )));
        }
        Ok(())
    }
}

/// One lookup request across every embedding table.
///
/// Batches live in pipeline slots and are refilled in place; `valid ==
/// false` marks the end-of-stream sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputBatch {
    pub valid: bool,
    pub inputs: Vec<EmbeddingInput>,
}

impl InputBatch {
    /// Preallocate a batch for `nr_embedding` tables
    pub fn with_capacity(nr_embedding: usize, nr_batches: usize, max_indices: usize) -> Self {
        Self {
            valid: false,
            inputs: (0..nr_embedding)
                .map(|_| EmbeddingInput {
                    indices: Vec::with_capacity(max_indices),
                    offsets: Vec::with_capacity(nr_batches),
                })
                .collect(),
        }
    }

    pub fn from_inputs(inputs: Vec<EmbeddingInput>) -> Self {
        Self {
            valid: true,
            inputs,
        }
    }

    /// The end-of-stream sentinel
    pub fn sentinel() -> Self {
        Self::default()
    }

    pub fn nr_embedding(&self) -> usize {
        self.inputs.len()
    }

    /// Bag count shared by every embedding, or `None` if they differ
    pub fn common_nr_batches(&self) -> Option<usize> {
        let first = self.inputs.first()?.nr_batches();
        self.inputs
            .iter()
            .all(|input| input.nr_batches() == first)
            .then_some(first)
    }

    pub fn max_indices_len(&self) -> usize {
        self.inputs.iter().map(EmbeddingInput::indices_len).max().unwrap_or(0)
    }

    /// Check `offsets[0] == 0`, non-decreasing offsets and `index < nr_rows`
    pub fn validate(&self, nr_rows: usize) -> Result<()> {
        self.inputs
            .iter()
            .enumerate()
            .try_for_each(|(e, input)| input.validate(e, nr_rows))
    }
}
