//! Placement of embedding columns onto PEs
//!
//! Every PE owns a contiguous column range of exactly one embedding table,
//! across all rows. Placement is round-robin over PE ordinals:
//!
//! ```text
//! nr_embedding = 2, nr_cols = 4, cols_per_pe = 2
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ PE 0         │ PE 1         │ PE 2         │ PE 3         │
//! │ emb 0 c0..2  │ emb 0 c2..4  │ emb 1 c0..2  │ emb 1 c2..4  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! With enough PEs every column gets its own PE. Otherwise columns are packed
//! `cols_per_pe` at a time, where `cols_per_pe` is the smallest divisor of
//! `nr_cols` that fits both the PE count and PE memory.

use crate::errors::{FleetError, Result};
use crate::fleet::{FleetLimits, Symbol, SymbolTable, WORD_BYTES};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Columns of one embedding owned by one PE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeAssignment {
    /// PE ordinal in the fleet
    pub pe: usize,

    /// Embedding table this PE serves
    pub embedding: usize,

    /// Start column (inclusive)
    pub column_start: usize,

    /// End column (exclusive)
    pub column_end: usize,
}

impl PeAssignment {
    pub fn num_columns(&self) -> usize {
        self.column_end - self.column_start
    }

    pub fn contains_column(&self, column: usize) -> bool {
        column >= self.column_start && column < self.column_end
    }

    pub fn column_range(&self) -> Range<usize> {
        self.column_start..self.column_end
    }
}

/// Derived, read-only placement for one workload shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankMapping {
    nr_embedding: usize,
    nr_rows: usize,
    nr_cols: usize,
    cols_per_pe: usize,
    batch_capacity: usize,
    emb_data_bytes: usize,
    assignments: Vec<PeAssignment>,
}

impl RankMapping {
    /// Compute the placement for `(nr_embedding, nr_batches, nr_rows, nr_cols)`.
    ///
    /// Fails with `CapacityExceeded` before anything touches the fleet when
    /// no placement satisfies the PE count and memory budget.
    pub fn compute(
        nr_embedding: usize,
        nr_batches: usize,
        nr_rows: usize,
        nr_cols: usize,
        limits: &FleetLimits,
    ) -> Result<Self> {
        if nr_embedding == 0 || nr_rows == 0 || nr_cols == 0 {
            return Err(FleetError::CapacityExceeded(format!(
                "empty workload: {} embeddings of {}x{}",
                nr_embedding, nr_rows, nr_cols
            )));
        }
        if nr_batches > limits.max_nr_batches {
            return Err(FleetError::CapacityExceeded(format!(
                "{} bags per call exceed kernel capacity {}",
                nr_batches, limits.max_nr_batches
            )));
        }

        let symbols = SymbolTable::for_limits(limits)?;
        let emb_capacity = symbols.capacity(Symbol::EmbData);
        // emb_capacity is aligned, so an unaligned fit is also an aligned fit
        let column_bytes = nr_rows
            .checked_mul(WORD_BYTES)
            .filter(|&bytes| bytes <= emb_capacity)
            .ok_or_else(|| {
                FleetError::CapacityExceeded(format!(
                    "one column of {} rows does not fit a PE holding {} bytes",
                    nr_rows, emb_capacity
                ))
            })?;

        let cols_per_pe = (1..=nr_cols)
            .filter(|w| nr_cols % w == 0)
            .filter(|&w| w <= limits.max_cols_per_pe)
            .filter(|&w| w.checked_mul(column_bytes).is_some_and(|bytes| bytes <= emb_capacity))
            .find(|&w| {
                nr_embedding
                    .checked_mul(nr_cols / w)
                    .is_some_and(|pes| pes <= limits.max_pes)
            })
            .ok_or_else(|| {
                FleetError::CapacityExceeded(format!(
                    "{} embeddings x {} columns do not fit {} PEs (max {} columns per PE)",
                    nr_embedding, nr_cols, limits.max_pes, limits.max_cols_per_pe
                ))
            })?;

        let shards = nr_cols / cols_per_pe;
        let assignments = (0..nr_embedding * shards)
            .map(|pe| {
                let shard = pe % shards;
                PeAssignment {
                    pe,
                    embedding: pe / shards,
                    column_start: shard * cols_per_pe,
                    column_end: (shard + 1) * cols_per_pe,
                }
            })
            .collect();

        Ok(Self {
            nr_embedding,
            nr_rows,
            nr_cols,
            cols_per_pe,
            batch_capacity: limits.max_nr_batches,
            emb_data_bytes: limits.align(cols_per_pe * column_bytes),
            assignments,
        })
    }

    pub fn nr_pes(&self) -> usize {
        self.assignments.len()
    }

    pub fn nr_embedding(&self) -> usize {
        self.nr_embedding
    }

    pub fn nr_rows(&self) -> usize {
        self.nr_rows
    }

    pub fn nr_cols(&self) -> usize {
        self.nr_cols
    }

    /// Columns owned by every PE
    pub fn cols_per_pe(&self) -> usize {
        self.cols_per_pe
    }

    /// PEs serving one embedding
    pub fn shards_per_embedding(&self) -> usize {
        self.nr_cols / self.cols_per_pe
    }

    /// Rows stored per PE (every PE holds full columns)
    pub fn row_capacity(&self) -> usize {
        self.nr_rows
    }

    /// Bags one PE can serve per call
    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Aligned size of one PE's `emb_data` transfer
    pub fn emb_data_bytes(&self) -> usize {
        self.emb_data_bytes
    }

    pub fn assignments(&self) -> &[PeAssignment] {
        &self.assignments
    }

    pub fn assignment(&self, pe: usize) -> &PeAssignment {
        &self.assignments[pe]
    }

    /// PE ordinals serving `embedding`
    pub fn pes_for_embedding(&self, embedding: usize) -> Range<usize> {
        let shards = self.shards_per_embedding();
        embedding * shards..(embedding + 1) * shards
    }

    /// PE owning `(embedding, column)` and the column's index on that PE
    pub fn owner(&self, embedding: usize, column: usize) -> (usize, usize) {
        let shard = column / self.cols_per_pe;
        (
            embedding * self.shards_per_embedding() + shard,
            column % self.cols_per_pe,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_pes: usize, pe_memory_bytes: usize, max_cols_per_pe: usize) -> FleetLimits {
        FleetLimits {
            max_pes,
            pe_memory_bytes,
            workers_per_pe: 4,
            transfer_alignment: 8,
            max_nr_batches: 16,
            max_indices: 256,
            max_cols_per_pe,
        }
    }

    fn assert_exact_cover(mapping: &RankMapping) {
        for e in 0..mapping.nr_embedding() {
            let mut owners = vec![0usize; mapping.nr_cols()];
            for a in mapping.assignments().iter().filter(|a| a.embedding == e) {
                for col in a.column_range() {
                    owners[col] += 1;
                }
            }
            for (col, count) in owners.iter().enumerate() {
                assert_eq!(*count, 1, "embedding {} column {} owned {} times", e, col, count);
            }
        }
    }

    #[test]
    fn test_simple_scheme_one_column_per_pe() {
        let mapping = RankMapping::compute(4, 8, 100, 16, &limits(64, 1 << 16, 8)).unwrap();
        assert_eq!(mapping.nr_pes(), 64);
        assert_eq!(mapping.cols_per_pe(), 1);
        assert_eq!(mapping.nr_embedding() * mapping.nr_cols(), mapping.nr_pes());

        let a = mapping.assignment(17);
        assert_eq!(a.embedding, 1);
        assert_eq!(a.column_range(), 1..2);
        assert_exact_cover(&mapping);
    }

    #[test]
    fn test_sharded_when_pes_are_scarce() {
        let mapping = RankMapping::compute(4, 8, 100, 16, &limits(20, 1 << 16, 8)).unwrap();
        // 16 columns in 4-wide shards: 4 embeddings x 4 shards = 16 PEs
        assert_eq!(mapping.cols_per_pe(), 4);
        assert_eq!(mapping.nr_pes(), 16);
        assert_eq!(mapping.shards_per_embedding(), 4);
        assert_eq!(mapping.pes_for_embedding(2), 8..12);
        assert_exact_cover(&mapping);
    }

    #[test]
    fn test_owner_matches_assignment() {
        let mapping = RankMapping::compute(3, 4, 50, 12, &limits(12, 1 << 16, 4)).unwrap();
        for e in 0..3 {
            for c in 0..12 {
                let (pe, local) = mapping.owner(e, c);
                let a = mapping.assignment(pe);
                assert_eq!(a.embedding, e);
                assert!(a.contains_column(c));
                assert_eq!(a.column_start + local, c);
            }
        }
    }

    #[test]
    fn test_coverage_over_many_shapes() {
        for nr_embedding in 1..=4 {
            for nr_cols in [1, 2, 3, 6, 8, 12] {
                for max_pes in [4, 9, 16, 64] {
                    if let Ok(mapping) =
                        RankMapping::compute(nr_embedding, 4, 32, nr_cols, &limits(max_pes, 1 << 14, 12))
                    {
                        assert!(mapping.nr_pes() <= max_pes);
                        assert_eq!(
                            mapping.nr_pes(),
                            nr_embedding * mapping.shards_per_embedding()
                        );
                        assert_exact_cover(&mapping);
                    }
                }
            }
        }
    }

    #[test]
    fn test_rows_exceeding_pe_memory_rejected() {
        // 4 KiB PE: per-call regions take 1248 bytes, a 1000-row column needs 4000
        let err = RankMapping::compute(1, 4, 1000, 2, &limits(8, 4096, 2)).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded(_)));
    }

    #[test]
    fn test_overflowing_shapes_rejected() {
        let l = limits(8, 4096, 2);
        let err = RankMapping::compute(1, 4, usize::MAX / 2, 2, &l).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded(_)));

        let err = RankMapping::compute(usize::MAX, 4, 4, 2, &l).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded(_)));
    }

    #[test]
    fn test_too_many_columns_rejected() {
        let err = RankMapping::compute(8, 4, 16, 7, &limits(4, 1 << 16, 16)).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded(_)));
    }

    #[test]
    fn test_batches_beyond_kernel_capacity_rejected() {
        assert!(RankMapping::compute(1, 17, 16, 1, &limits(4, 1 << 16, 1)).is_err());
    }

    #[test]
    fn test_deterministic() {
        let l = limits(32, 1 << 16, 4);
        assert_eq!(
            RankMapping::compute(3, 8, 64, 8, &l).unwrap(),
            RankMapping::compute(3, 8, 64, 8, &l).unwrap()
        );
    }
}
