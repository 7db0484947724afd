use super::stats::{LookupStats, Phase};
use crate::embedding::{InputBatch, PartialResults};
use crate::errors::{FleetError, Result};
use crate::fleet::{FleetHandle, QueryLengths, Symbol, DESCRIPTOR_BYTES, WORD_BYTES};
use crate::mapping::RankMapping;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Progress of the most recent lookup call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    IndicesSent,
    OffsetsSent,
    LengthsSent,
    Launched,
    Gathering,
    Done,
}

/// Copy `bytes` into a shared buffer zero-padded to `size`
fn padded(bytes: &[u8], size: usize) -> Arc<[u8]> {
    let mut buffer = Vec::with_capacity(size.max(bytes.len()));
    buffer.extend_from_slice(bytes);
    buffer.resize(size.max(bytes.len()), 0);
    Arc::from(buffer)
}

/// Drives lookup calls against one fleet.
///
/// The gather buffers and the partial-result arena are allocated once and
/// reused by every call.
pub struct LookupDispatcher {
    state: DispatchState,
    partials: PartialResults,
    staging: Vec<Vec<u8>>,
    stats: Arc<LookupStats>,
}

impl LookupDispatcher {
    pub fn new(mapping: &RankMapping) -> Self {
        Self {
            state: DispatchState::Idle,
            partials: PartialResults::new(mapping.nr_pes(), mapping.cols_per_pe(), 0),
            staging: vec![Vec::new(); mapping.nr_pes()],
            stats: Arc::new(LookupStats::new()),
        }
    }

    /// Share a statistics tracker with other components
    pub fn with_stats(mut self, stats: Arc<LookupStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn stats(&self) -> &Arc<LookupStats> {
        &self.stats
    }

    /// Partial sums of the last successful call
    pub fn partials(&self) -> &PartialResults {
        &self.partials
    }

    /// Run one lookup call and return the gathered partial sums.
    ///
    /// Shape problems are rejected before any transfer is submitted.
    pub async fn lookup(
        &mut self,
        fleet: &FleetHandle,
        mapping: &RankMapping,
        batch: &InputBatch,
    ) -> Result<&PartialResults> {
        let started = Instant::now();
        self.state = DispatchState::Idle;

        match self.dispatch(fleet, mapping, batch).await {
            Ok(bags) => {
                self.stats.record_success(bags, started.elapsed());
                Ok(&self.partials)
            }
            Err(e) => {
                warn!(state = ?self.state, error = %e, "Lookup failed");
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    fn advance(&mut self, next: DispatchState, call_id: Uuid) {
        debug!(%call_id, from = ?self.state, to = ?next, "Dispatch transition");
        self.state = next;
    }

    /// Returns `nr_batches` accepted before any transfer
    fn check_preconditions(
        fleet: &FleetHandle,
        mapping: &RankMapping,
        batch: &InputBatch,
    ) -> Result<usize> {
        if fleet.is_poisoned() {
            return Err(FleetError::TransferError(
                "fleet is poisoned by an earlier failure".to_string(),
            ));
        }
        if fleet.nr_pes() != mapping.nr_pes() {
            return Err(FleetError::DispatchError(format!(
                "mapping needs {} PEs, fleet has {}",
                mapping.nr_pes(),
                fleet.nr_pes()
            )));
        }
        if batch.nr_embedding() != mapping.nr_embedding() {
            return Err(FleetError::UnsupportedBatchShape(format!(
                "batch covers {} embeddings, mapping has {}",
                batch.nr_embedding(),
                mapping.nr_embedding()
            )));
        }
        let nr_batches = batch.common_nr_batches().ok_or_else(|| {
            let counts: Vec<usize> = batch.inputs.iter().map(|i| i.nr_batches()).collect();
            FleetError::UnsupportedBatchShape(format!(
                "embeddings must share one batch count, got {:?}",
                counts
            ))
        })?;
        if nr_batches > mapping.batch_capacity() {
            return Err(FleetError::CapacityExceeded(format!(
                "{} bags exceed per-PE batch capacity {}",
                nr_batches,
                mapping.batch_capacity()
            )));
        }
        if batch.max_indices_len() > fleet.limits().max_indices {
            return Err(FleetError::CapacityExceeded(format!(
                "{} indices exceed per-PE capacity {}",
                batch.max_indices_len(),
                fleet.limits().max_indices
            )));
        }
        batch.validate(mapping.nr_rows())?;
        Ok(nr_batches)
    }

    #[instrument(skip_all, fields(nr_pes = mapping.nr_pes()))]
    async fn dispatch(
        &mut self,
        fleet: &FleetHandle,
        mapping: &RankMapping,
        batch: &InputBatch,
    ) -> Result<u64> {
        let nr_batches = Self::check_preconditions(fleet, mapping, batch)?;
        let call_id = Uuid::new_v4();

        let prepare = Instant::now();
        let indices_size = fleet.align(batch.max_indices_len() * WORD_BYTES);
        let offsets_size = fleet.align(nr_batches * WORD_BYTES);
        let lengths_size = fleet.align(DESCRIPTOR_BYTES);
        let results_size = fleet.align(nr_batches * mapping.cols_per_pe() * WORD_BYTES);

        // one buffer per embedding, shared by every PE serving it
        let mut indices = Vec::with_capacity(batch.nr_embedding());
        let mut offsets = Vec::with_capacity(batch.nr_embedding());
        let mut lengths = Vec::with_capacity(batch.nr_embedding());
        for input in &batch.inputs {
            indices.push(padded(bytemuck::cast_slice(&input.indices), indices_size));
            offsets.push(padded(bytemuck::cast_slice(&input.offsets), offsets_size));
            let descriptor = QueryLengths {
                indices_len: input.indices_len() as u64,
                nr_batches: nr_batches as u64,
            };
            lengths.push(padded(&descriptor.to_bytes(), lengths_size));
        }
        let per_pe = |per_embedding: &[Arc<[u8]>]| -> Vec<Arc<[u8]>> {
            mapping
                .assignments()
                .iter()
                .map(|a| Arc::clone(&per_embedding[a.embedding]))
                .collect()
        };
        self.stats.record_phase(Phase::Prepare, prepare.elapsed());

        let copy_in = Instant::now();
        fleet.push(Symbol::InputIndices, 0, indices_size, per_pe(&indices))?;
        self.advance(DispatchState::IndicesSent, call_id);
        fleet.push(Symbol::InputOffsets, 0, offsets_size, per_pe(&offsets))?;
        self.advance(DispatchState::OffsetsSent, call_id);
        fleet.push(Symbol::InputLengths, 0, lengths_size, per_pe(&lengths))?;
        self.advance(DispatchState::LengthsSent, call_id);
        self.stats.record_phase(Phase::CopyIn, copy_in.elapsed());

        let launch = Instant::now();
        fleet.launch()?;
        self.advance(DispatchState::Launched, call_id);

        let mut staging = std::mem::take(&mut self.staging);
        if staging.len() != mapping.nr_pes() {
            // buffers are dropped by the fleet when a previous call failed
            staging = vec![Vec::new(); mapping.nr_pes()];
        }
        let pending = fleet.pull(Symbol::Results, 0, results_size, staging)?;
        self.advance(DispatchState::Gathering, call_id);

        fleet.sync().await?;
        self.staging = pending.wait().await?;
        self.stats.record_phase(Phase::Launch, launch.elapsed());

        let copy_out = Instant::now();
        if self.partials.nr_pes() != mapping.nr_pes()
            || self.partials.cols_per_pe() != mapping.cols_per_pe()
        {
            self.partials = PartialResults::new(mapping.nr_pes(), mapping.cols_per_pe(), nr_batches);
        } else {
            self.partials.reset(nr_batches);
        }
        for (pe, bytes) in self.staging.iter().enumerate() {
            let dst = self.partials.pe_mut(pe);
            for (value, word) in dst.iter_mut().zip(bytes.chunks_exact(WORD_BYTES)) {
                *value = bytemuck::pod_read_unaligned(word);
            }
        }
        self.stats.record_phase(Phase::CopyOut, copy_out.elapsed());

        self.advance(DispatchState::Done, call_id);
        Ok((nr_batches * mapping.nr_embedding()) as u64)
    }
}
