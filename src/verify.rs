//! Host-side reference check of device results

use crate::embedding::{EmbeddingInput, EmbeddingTable, InputBatch, ResultBuffer};
use crate::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Largest tolerated `|device * 1e9 - host|`
pub const TOLERANCE: f64 = 1000.0;

/// Mismatches kept for diagnostics; the rest are only counted
const MAX_REPORTED: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub embedding: usize,
    pub batch: usize,
    pub col: usize,
    /// Device value scaled back to fixed point
    pub device: f64,
    pub host: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub checked: usize,
    pub mismatch_count: usize,
    pub mismatches: Vec<Mismatch>,
}

/// Bag sums of one table computed on the host, `[batch][col]`.
///
/// Sums wrap on overflow like the device does.
pub fn reference_bag_sums(table: &EmbeddingTable, input: &EmbeddingInput) -> Result<Vec<i32>> {
    input.validate(0, table.nr_rows())?;
    let nr_cols = table.nr_cols();
    let mut sums = vec![0i32; input.nr_batches() * nr_cols];
    if nr_cols == 0 {
        return Ok(sums);
    }

    for (batch, out) in sums.chunks_exact_mut(nr_cols).enumerate() {
        for &index in &input.indices[input.bag(batch)] {
            let row = index as usize;
            let weights = &table.as_row_major()[row * nr_cols..(row + 1) * nr_cols];
            for (acc, &w) in out.iter_mut().zip(weights) {
                *acc = acc.wrapping_add(w);
            }
        }
    }
    Ok(sums)
}

/// Compare device results of one call against the host reference.
///
/// A mismatch makes the report invalid; only inconsistent shapes are errors.
pub fn check_inference(
    tables: &[EmbeddingTable],
    batch: &InputBatch,
    results: &ResultBuffer,
) -> Result<VerificationReport> {
    if tables.len() != batch.nr_embedding() || results.nr_embedding() != batch.nr_embedding() {
        return Err(FleetError::InvalidTable(format!(
            "{} tables, {} inputs, {} result sets",
            tables.len(),
            batch.nr_embedding(),
            results.nr_embedding()
        )));
    }

    let mut report = VerificationReport {
        valid: true,
        ..Default::default()
    };

    for (embedding, (table, input)) in tables.iter().zip(&batch.inputs).enumerate() {
        if table.nr_cols() != results.nr_cols() || input.nr_batches() != results.nr_batches() {
            return Err(FleetError::InvalidTable(format!(
                "embedding {}: {} columns x {} bags, results hold {} x {}",
                embedding,
                table.nr_cols(),
                input.nr_batches(),
                results.nr_cols(),
                results.nr_batches()
            )));
        }

        let host = reference_bag_sums(table, input)?;
        for (i, (&device, &expected)) in results.embedding(embedding).iter().zip(&host).enumerate() {
            report.checked += 1;
            let scaled = device as f64 * 1e9;
            if (scaled - expected as f64).abs() > TOLERANCE {
                report.valid = false;
                report.mismatch_count += 1;
                if report.mismatches.len() < MAX_REPORTED {
                    report.mismatches.push(Mismatch {
                        embedding,
                        batch: i / table.nr_cols(),
                        col: i % table.nr_cols(),
                        device: scaled,
                        host: expected,
                    });
                }
            }
        }
    }

    if report.valid {
        info!(checked = report.checked, "Device results match host reference");
    } else {
        warn!(
            checked = report.checked,
            mismatches = report.mismatch_count,
            first = ?report.mismatches.first(),
            "Device results differ from host reference"
        );
    }
    Ok(report)
}
