//! Synthetic weights and lookup requests for benchmarking and tests

use crate::config::{IndicesPerBatch, WorkloadConfig};
use crate::embedding::{EmbeddingTable, InputBatch};
use crate::errors::Result;
use crate::pipeline::BatchSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random tables whose bag sums stay clear of `i32` overflow.
///
/// Each weight is `i32::MAX * u / indices_per_batch` for `u` uniform in
/// `[0, 1)`, so a bag of at most `indices_per_batch` rows cannot wrap.
pub fn synthetic_tables(workload: &WorkloadConfig) -> Vec<EmbeddingTable> {
    let mut rng = StdRng::seed_from_u64(workload.seed);
    let per_bag = workload.indices_per_batch.max().max(1) as f64;
    (0..workload.nr_embedding)
        .map(|_| {
            EmbeddingTable::from_fn(workload.nr_rows, workload.nr_cols, |_, _| {
                let u: f64 = rng.random();
                (i32::MAX as f64 * u / per_bag) as i32
            })
        })
        .collect()
}

/// Endless stream of random lookup requests
#[derive(Debug)]
pub struct SyntheticSource {
    rng: StdRng,
    nr_rows: u32,
    nr_batches: usize,
    indices_per_batch: IndicesPerBatch,
}

impl SyntheticSource {
    pub fn new(workload: &WorkloadConfig) -> Self {
        Self {
            // distinct stream from the table generator
            rng: StdRng::seed_from_u64(workload.seed.wrapping_add(1)),
            nr_rows: workload.nr_rows as u32,
            nr_batches: workload.nr_batches,
            indices_per_batch: workload.indices_per_batch,
        }
    }

    fn bag_len(&mut self) -> usize {
        match self.indices_per_batch {
            IndicesPerBatch::Fixed(n) => n,
            IndicesPerBatch::Random { min, max } => self.rng.random_range(min..=max),
        }
    }
}

impl BatchSource for SyntheticSource {
    fn fill(&mut self, batch: &mut InputBatch) -> Result<()> {
        for input in &mut batch.inputs {
            input.indices.clear();
            input.offsets.clear();
            for _ in 0..self.nr_batches {
                input.offsets.push(input.indices.len() as u32);
                for _ in 0..self.bag_len() {
                    input.indices.push(self.rng.random_range(0..self.nr_rows));
                }
            }
        }
        Ok(())
    }
}
