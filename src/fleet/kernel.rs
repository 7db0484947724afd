//! Sum-mode EmbeddingBag kernel executed by every PE
//!
//! Execution model of one launch on one PE:
//!
//! ```text
//! worker 0 ── copy lengths/indices/offsets to local memory ──┐
//! worker 1..W ───────────────────────────────────────────────┤ barrier 1
//! worker w ── bags b with b % W == w: Σ weight[col][indices[i]] ┤ barrier 2
//! worker 0 ── write results[local_col][bag] ──────────────────┘
//! ```
//!
//! Arithmetic is wrapping `i32`, matching the device.

use super::limits::{FleetLimits, WORD_BYTES};
use super::memory::{PeMemory, Region, DESCRIPTOR_BYTES};
use crate::errors::{FleetError, Result};
use std::sync::{Barrier, Mutex, OnceLock};
use std::thread;

/// Per-call loop bounds, the `input_lengths` descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryLengths {
    pub indices_len: u64,
    pub nr_batches: u64,
}

/// Weight layout of one PE, the `emb_shape` descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmbShape {
    pub nr_rows: u64,
    pub nr_cols: u64,
}

macro_rules! descriptor_codec {
    ($ty:ty, $a:ident, $b:ident) => {
        impl $ty {
            pub fn to_bytes(&self) -> [u8; DESCRIPTOR_BYTES] {
                let mut out = [0u8; DESCRIPTOR_BYTES];
                out[..8].copy_from_slice(bytemuck::bytes_of(&self.$a));
                out[8..].copy_from_slice(bytemuck::bytes_of(&self.$b));
                out
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self {
                    $a: bytemuck::pod_read_unaligned(&bytes[..8]),
                    $b: bytemuck::pod_read_unaligned(&bytes[8..DESCRIPTOR_BYTES]),
                }
            }
        }
    };
}

descriptor_codec!(QueryLengths, indices_len, nr_batches);
descriptor_codec!(EmbShape, nr_rows, nr_cols);

/// Inputs staged by worker 0 before the first barrier
#[derive(Debug)]
struct LocalInputs {
    lengths: QueryLengths,
    indices: Vec<u32>,
    offsets: Vec<u32>,
}

struct Shared<'a> {
    workers: usize,
    shape: EmbShape,
    weights: &'a [u8],
    barrier: Barrier,
    inputs: OnceLock<std::result::Result<LocalInputs, String>>,
    scratch: Mutex<Vec<i32>>,
    fault: Mutex<Option<String>>,
}

#[inline]
fn read_i32(bytes: &[u8], word: usize) -> i32 {
    bytemuck::pod_read_unaligned(&bytes[word * WORD_BYTES..(word + 1) * WORD_BYTES])
}

#[inline]
fn read_u32(bytes: &[u8], word: usize) -> u32 {
    bytemuck::pod_read_unaligned(&bytes[word * WORD_BYTES..(word + 1) * WORD_BYTES])
}

fn read_words(region: &Region, count: usize) -> std::result::Result<Vec<u32>, String> {
    if count * WORD_BYTES > region.capacity() {
        return Err(format!(
            "{} words exceed region capacity of {} bytes",
            count,
            region.capacity()
        ));
    }
    let bytes = region.as_bytes();
    Ok((0..count)
        .map(|i| {
            if (i + 1) * WORD_BYTES <= bytes.len() {
                read_u32(bytes, i)
            } else {
                0
            }
        })
        .collect())
}

impl Shared<'_> {
    fn stage_inputs(
        &self,
        lengths: &Region,
        indices: &Region,
        offsets: &Region,
        limits: &FleetLimits,
    ) -> std::result::Result<LocalInputs, String> {
        if lengths.as_bytes().len() < DESCRIPTOR_BYTES {
            return Err("input_lengths was never written".to_string());
        }
        let lengths = QueryLengths::from_bytes(lengths.as_bytes());
        let indices_len = lengths.indices_len as usize;
        let nr_batches = lengths.nr_batches as usize;

        if indices_len > limits.max_indices {
            return Err(format!(
                "indices_len {} exceeds kernel capacity {}",
                indices_len, limits.max_indices
            ));
        }
        if nr_batches > limits.max_nr_batches {
            return Err(format!(
                "nr_batches {} exceeds kernel capacity {}",
                nr_batches, limits.max_nr_batches
            ));
        }

        Ok(LocalInputs {
            lengths,
            indices: read_words(indices, indices_len)?,
            offsets: read_words(offsets, nr_batches)?,
        })
    }

    /// Sum every bag assigned to `worker` into the shared scratch buffer
    fn reduce(&self, worker: usize, inputs: &LocalInputs) -> std::result::Result<(), String> {
        let nr_rows = self.shape.nr_rows as usize;
        let nr_cols = self.shape.nr_cols as usize;
        let nr_batches = inputs.lengths.nr_batches as usize;
        let indices_len = inputs.lengths.indices_len as usize;

        let mut sums = vec![0i32; nr_cols];
        let mut local: Vec<(usize, Vec<i32>)> = Vec::new();

        for bag in (worker..nr_batches).step_by(self.workers) {
            let start = inputs.offsets[bag] as usize;
            let end = if bag + 1 < nr_batches {
                inputs.offsets[bag + 1] as usize
            } else {
                indices_len
            };
            if start > end || end > indices_len {
                return Err(format!("bag {} spans invalid range {}..{}", bag, start, end));
            }

            sums.fill(0);
            for &index in &inputs.indices[start..end] {
                let row = index as usize;
                if row >= nr_rows {
                    return Err(format!("index {} out of range for {} rows", row, nr_rows));
                }
                for (col, sum) in sums.iter_mut().enumerate() {
                    *sum = sum.wrapping_add(read_i32(self.weights, col * nr_rows + row));
                }
            }
            local.push((bag, sums.clone()));
        }

        let mut scratch = self
            .scratch
            .lock()
            .map_err(|_| "result scratch poisoned".to_string())?;
        for (bag, bag_sums) in local {
            for (col, value) in bag_sums.into_iter().enumerate() {
                scratch[col * nr_batches + bag] = value;
            }
        }
        Ok(())
    }

    fn record_fault(&self, fault: String) {
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(fault);
        }
    }

    /// Body shared by all workers between the two barriers
    fn compute(&self, worker: usize) {
        match self.inputs.get() {
            Some(Ok(inputs)) => {
                if let Err(fault) = self.reduce(worker, inputs) {
                    self.record_fault(fault);
                }
            }
            // worker 0 already recorded the staging failure
            Some(Err(_)) => {}
            None => self.record_fault("inputs not staged before barrier".to_string()),
        }
    }
}

/// Run one launch on one PE.
///
/// A fault (bad descriptor, index out of range, weights missing) leaves
/// `results` untouched and is reported as a launch failure.
pub fn run(pe: usize, memory: &mut PeMemory, limits: &FleetLimits) -> Result<()> {
    let fault = |msg: String| FleetError::DispatchError(format!("PE {} kernel fault: {}", pe, msg));

    if memory.emb_shape.as_bytes().len() < DESCRIPTOR_BYTES {
        return Err(fault("emb_shape was never written".to_string()));
    }
    let shape = EmbShape::from_bytes(memory.emb_shape.as_bytes());
    let weight_bytes = (shape.nr_rows * shape.nr_cols) as usize * WORD_BYTES;
    if memory.emb_data.as_bytes().len() < weight_bytes {
        return Err(fault(format!(
            "emb_data holds {} bytes, shape needs {}",
            memory.emb_data.as_bytes().len(),
            weight_bytes
        )));
    }

    let PeMemory {
        emb_data,
        input_indices,
        input_offsets,
        input_lengths,
        results,
        ..
    } = memory;

    let workers = limits.workers_per_pe.max(1);
    let shared = Shared {
        workers,
        shape,
        weights: emb_data.as_bytes(),
        barrier: Barrier::new(workers),
        inputs: OnceLock::new(),
        scratch: Mutex::new(Vec::new()),
        fault: Mutex::new(None),
    };

    let outcome: std::result::Result<(), String> = thread::scope(|scope| {
        let shared = &shared;
        for worker in 1..workers {
            scope.spawn(move || {
                shared.barrier.wait();
                shared.compute(worker);
                shared.barrier.wait();
            });
        }

        // worker 0: single-owner setup
        let staged = shared.stage_inputs(input_lengths, input_indices, input_offsets, limits);
        if let Ok(inputs) = &staged {
            let cells = inputs.lengths.nr_batches as usize * shape.nr_cols as usize;
            if let Ok(mut scratch) = shared.scratch.lock() {
                scratch.clear();
                scratch.resize(cells, 0);
            }
        }
        if let Err(msg) = &staged {
            shared.record_fault(msg.clone());
        }
        let _ = shared.inputs.set(staged);
        shared.barrier.wait();

        shared.compute(0);
        shared.barrier.wait();

        // worker 0: write back
        if let Some(msg) = shared.fault.lock().map_err(|_| "fault slot poisoned")?.take() {
            return Err(msg);
        }
        let scratch = shared.scratch.lock().map_err(|_| "result scratch poisoned")?;
        let bytes: &[u8] = bytemuck::cast_slice(scratch.as_slice());
        let padded = limits.align(bytes.len());
        let mut out = vec![0u8; padded];
        out[..bytes.len()].copy_from_slice(bytes);
        results
            .write(0, &out)
            .map_err(|e| format!("results write-back failed: {}", e))
    });

    outcome.map_err(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::memory::{Symbol, SymbolTable};

    fn limits(workers: usize) -> FleetLimits {
        FleetLimits {
            max_pes: 4,
            pe_memory_bytes: 8192,
            workers_per_pe: workers,
            transfer_alignment: 8,
            max_nr_batches: 8,
            max_indices: 64,
            max_cols_per_pe: 2,
        }
    }

    fn words(values: &[u32]) -> Vec<u8> {
        let mut bytes: Vec<u8> = bytemuck::cast_slice(values).to_vec();
        bytes.resize(crate::fleet::limits::align_up(bytes.len(), 8), 0);
        bytes
    }

    /// Load column-major weights and one query onto a fresh PE
    fn prepared_pe(
        limits: &FleetLimits,
        columns: &[Vec<i32>],
        indices: &[u32],
        offsets: &[u32],
    ) -> PeMemory {
        let table = SymbolTable::for_limits(limits).unwrap();
        let mut mem = PeMemory::new(&table);
        let nr_rows = columns[0].len();
        let flat: Vec<i32> = columns.iter().flatten().copied().collect();
        let mut weights: Vec<u8> = bytemuck::cast_slice(&flat).to_vec();
        weights.resize(limits.align(weights.len()), 0);

        let shape = EmbShape {
            nr_rows: nr_rows as u64,
            nr_cols: columns.len() as u64,
        };
        let lengths = QueryLengths {
            indices_len: indices.len() as u64,
            nr_batches: offsets.len() as u64,
        };
        mem.write(Symbol::EmbShape, 0, &shape.to_bytes(), 8).unwrap();
        mem.write(Symbol::EmbData, 0, &weights, 8).unwrap();
        mem.write(Symbol::InputIndices, 0, &words(indices), 8).unwrap();
        mem.write(Symbol::InputOffsets, 0, &words(offsets), 8).unwrap();
        mem.write(Symbol::InputLengths, 0, &lengths.to_bytes(), 8).unwrap();
        mem
    }

    fn results_of(mem: &PeMemory, count: usize) -> Vec<i32> {
        (0..count).map(|i| read_i32(mem.results.as_bytes(), i)).collect()
    }

    #[test]
    fn test_descriptor_codec() {
        let lengths = QueryLengths {
            indices_len: 7,
            nr_batches: 3,
        };
        assert_eq!(QueryLengths::from_bytes(&lengths.to_bytes()), lengths);
    }

    #[test]
    fn test_single_bag_sum() {
        let limits = limits(4);
        let mut mem = prepared_pe(&limits, &[vec![10, 20, 30, 40, 50, 60]], &[2, 5, 5], &[0]);
        run(0, &mut mem, &limits).unwrap();
        assert_eq!(results_of(&mem, 1), vec![150]);
    }

    #[test]
    fn test_last_bag_uses_indices_len() {
        let limits = limits(2);
        let column: Vec<i32> = (0..8).map(|r| 1 << r).collect();
        let indices = [0, 1, 2, 3, 4, 5, 6];
        let offsets = [0, 2, 5];
        let mut mem = prepared_pe(&limits, &[column], &indices, &offsets);
        run(0, &mut mem, &limits).unwrap();
        // bags [0,2) [2,5) [5,7)
        assert_eq!(results_of(&mem, 3), vec![0b11, 0b11100, 0b1100000]);
    }

    #[test]
    fn test_multi_column_layout() {
        let limits = limits(3);
        let columns = vec![vec![1, 2, 3], vec![100, 200, 300]];
        let mut mem = prepared_pe(&limits, &columns, &[0, 2, 1, 1], &[0, 2]);
        run(0, &mut mem, &limits).unwrap();
        // [col][bag]
        assert_eq!(results_of(&mem, 4), vec![4, 4, 400, 400]);
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let column: Vec<i32> = (0..16).map(|r| r * 7 - 20).collect();
        let indices: Vec<u32> = (0..40).map(|i| (i * 5 % 16) as u32).collect();
        let offsets = [0, 3, 3, 10, 22, 30, 31, 35];

        let mut reference = None;
        for workers in [1, 2, 3, 8, 16] {
            let limits = limits(workers);
            let mut mem = prepared_pe(&limits, &[column.clone()], &indices, &offsets);
            run(0, &mut mem, &limits).unwrap();
            let out = results_of(&mem, offsets.len());
            match &reference {
                None => reference = Some(out),
                Some(expected) => assert_eq!(&out, expected, "workers = {}", workers),
            }
        }
    }

    #[test]
    fn test_index_out_of_range_faults() {
        let limits = limits(2);
        let mut mem = prepared_pe(&limits, &[vec![1, 2, 3]], &[0, 9], &[0]);
        let err = run(3, &mut mem, &limits).unwrap_err();
        assert!(matches!(err, FleetError::DispatchError(_)));
        assert!(err.to_string().contains("PE 3"));
    }

    #[test]
    fn test_missing_weights_fault() {
        let limits = limits(2);
        let table = SymbolTable::for_limits(&limits).unwrap();
        let mut mem = PeMemory::new(&table);
        assert!(run(0, &mut mem, &limits).is_err());
    }
}
