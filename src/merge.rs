//! Reassemble per-PE partial sums into per-embedding result vectors

use crate::embedding::{PartialResults, ResultBuffer};
use crate::errors::{FleetError, Result};
use crate::mapping::RankMapping;
use rayon::prelude::*;

/// Fixed-point scale of the quantised weights
pub const DESCALE: f64 = 1e-9;

/// Convert one raw device sum to its float value
#[inline]
pub fn descale(raw: i32) -> f32 {
    (raw as f64 * DESCALE) as f32
}

/// Stateless merger from the flat partial arena to [`ResultBuffer`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMerger;

impl ResultMerger {
    pub fn new() -> Self {
        Self
    }

    /// Overwrite `results` with the descaled sums of `partials`.
    ///
    /// `results[e][b * nr_cols + c]` takes the value computed by the PE that
    /// owns column `c` of embedding `e`. Every column has exactly one owner,
    /// so each element is written once.
    pub fn merge(
        &self,
        partials: &PartialResults,
        mapping: &RankMapping,
        results: &mut ResultBuffer,
    ) -> Result<()> {
        if partials.nr_pes() != mapping.nr_pes() || partials.cols_per_pe() != mapping.cols_per_pe() {
            return Err(FleetError::DispatchError(format!(
                "partials shaped {}x{} do not match mapping {}x{}",
                partials.nr_pes(),
                partials.cols_per_pe(),
                mapping.nr_pes(),
                mapping.cols_per_pe()
            )));
        }
        if results.nr_embedding() != mapping.nr_embedding() || results.nr_cols() != mapping.nr_cols() {
            return Err(FleetError::Config(format!(
                "result buffer for {} embeddings x {} columns, mapping has {} x {}",
                results.nr_embedding(),
                results.nr_cols(),
                mapping.nr_embedding(),
                mapping.nr_cols()
            )));
        }

        let nr_batches = partials.nr_batches();
        let nr_cols = mapping.nr_cols();
        results.reset(nr_batches);

        results
            .embeddings_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(embedding, values)| {
                for assignment in &mapping.assignments()[mapping.pes_for_embedding(embedding)] {
                    let partial = partials.pe(assignment.pe);
                    for (local_col, col) in assignment.column_range().enumerate() {
                        let sums = &partial[local_col * nr_batches..(local_col + 1) * nr_batches];
                        for (batch, &raw) in sums.iter().enumerate() {
                            values[batch * nr_cols + col] = descale(raw);
                        }
                    }
                }
            });
        Ok(())
    }

    /// Allocating variant of [`merge`](Self::merge)
    pub fn merge_into_new(&self, partials: &PartialResults, mapping: &RankMapping) -> Result<ResultBuffer> {
        let mut results = ResultBuffer::new(mapping.nr_embedding(), partials.nr_batches(), mapping.nr_cols());
        self.merge(partials, mapping, &mut results)?;
        Ok(results)
    }
}
