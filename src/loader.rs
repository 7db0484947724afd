//! Weight loading
//!
//! Each table is transposed once to column-major order, then every PE
//! receives the contiguous slice covering its column range in a single bulk
//! transfer to `emb_data`, followed by the `emb_shape` descriptor. Loading
//! is one-shot and blocking; a failure poisons the fleet and the caller
//! must not dispatch afterwards.

use crate::embedding::EmbeddingTable;
use crate::errors::{FleetError, Result};
use crate::fleet::{EmbShape, FleetHandle, Symbol, WORD_BYTES};
use crate::mapping::RankMapping;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

fn check_tables(fleet: &FleetHandle, mapping: &RankMapping, tables: &[EmbeddingTable]) -> Result<()> {
    if fleet.nr_pes() != mapping.nr_pes() {
        return Err(FleetError::Config(format!(
            "mapping needs {} PEs, fleet has {}",
            mapping.nr_pes(),
            fleet.nr_pes()
        )));
    }
    if tables.len() != mapping.nr_embedding() {
        return Err(FleetError::InvalidTable(format!(
            "mapping expects {} tables, got {}",
            mapping.nr_embedding(),
            tables.len()
        )));
    }
    for (e, table) in tables.iter().enumerate() {
        if table.nr_rows() != mapping.nr_rows() || table.nr_cols() != mapping.nr_cols() {
            return Err(FleetError::InvalidTable(format!(
                "table {} is {}x{}, mapping expects {}x{}",
                e,
                table.nr_rows(),
                table.nr_cols(),
                mapping.nr_rows(),
                mapping.nr_cols()
            )));
        }
    }
    Ok(())
}

/// Transpose and transfer every table into its owners' `emb_data`.
pub async fn load_weights(
    fleet: &FleetHandle,
    mapping: &RankMapping,
    tables: &[EmbeddingTable],
) -> Result<()> {
    if fleet.is_poisoned() {
        return Err(FleetError::TransferError(
            "fleet is poisoned by an earlier failure".to_string(),
        ));
    }
    check_tables(fleet, mapping, tables)?;
    let started = Instant::now();

    let nr_rows = mapping.nr_rows();
    let size = mapping.emb_data_bytes();
    let transposed: Vec<Vec<i32>> = tables.iter().map(EmbeddingTable::transpose).collect();

    let weights: Vec<Arc<[u8]>> = mapping
        .assignments()
        .iter()
        .map(|a| {
            let columns = &transposed[a.embedding][a.column_start * nr_rows..a.column_end * nr_rows];
            let mut buffer = Vec::with_capacity(size);
            buffer.extend_from_slice(bytemuck::cast_slice(columns));
            buffer.resize(size, 0);
            Arc::from(buffer)
        })
        .collect();

    let shape = EmbShape {
        nr_rows: nr_rows as u64,
        nr_cols: mapping.cols_per_pe() as u64,
    };
    let shape_size = fleet.align(shape.to_bytes().len());
    let mut shape_bytes = shape.to_bytes().to_vec();
    shape_bytes.resize(shape_size, 0);
    let shape_bytes: Arc<[u8]> = Arc::from(shape_bytes);
    let shapes = vec![shape_bytes; mapping.nr_pes()];

    let submitted = fleet
        .push(Symbol::EmbData, 0, size, weights)
        .and_then(|_| fleet.push(Symbol::EmbShape, 0, shape_size, shapes));
    let outcome = match submitted {
        Ok(()) => fleet.sync().await,
        Err(e) => Err(e),
    };

    if let Err(e) = outcome {
        fleet.poison();
        error!(error = %e, "Weight load failed");
        return Err(match e {
            FleetError::TransferError(msg) => FleetError::TransferError(msg),
            other => FleetError::TransferError(other.to_string()),
        });
    }

    info!(
        nr_embedding = mapping.nr_embedding(),
        nr_pes = mapping.nr_pes(),
        bytes_per_pe = size,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Embedding weights loaded"
    );
    Ok(())
}

/// Read one PE's weights back, column-major `[local_col][row]`
pub async fn read_back(fleet: &FleetHandle, mapping: &RankMapping, pe: usize) -> Result<Vec<i32>> {
    let bytes = fleet
        .copy_from(pe, Symbol::EmbData, 0, mapping.emb_data_bytes())
        .await?;
    let words = mapping.cols_per_pe() * mapping.nr_rows();
    Ok(bytes[..words * WORD_BYTES]
        .chunks_exact(WORD_BYTES)
        .map(bytemuck::pod_read_unaligned::<i32>)
        .collect())
}
