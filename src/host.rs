//! Host call surface: one fleet, one mapping, reusable lookup buffers

use crate::config::RunConfig;
use crate::dispatch::{LookupDispatcher, LookupStats, Phase};
use crate::embedding::{EmbeddingTable, InputBatch, ResultBuffer};
use crate::errors::Result;
use crate::fleet::{FleetHandle, FleetLimits};
use crate::loader;
use crate::mapping::RankMapping;
use crate::merge::ResultMerger;
use crate::pipeline::{BatchSource, PipelineController, PipelineReport, ResultSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub struct EmbeddingHost {
    fleet: FleetHandle,
    mapping: RankMapping,
    dispatcher: LookupDispatcher,
    merger: ResultMerger,
    results: ResultBuffer,
    stats: Arc<LookupStats>,
}

impl EmbeddingHost {
    /// Plan the placement for the configured workload and allocate its fleet
    pub fn new(config: &RunConfig) -> Result<Self> {
        config.validate()?;
        let w = &config.workload;
        Self::with_limits(w.nr_embedding, w.nr_batches, w.nr_rows, w.nr_cols, config.fleet.clone())
    }

    pub fn with_limits(
        nr_embedding: usize,
        nr_batches: usize,
        nr_rows: usize,
        nr_cols: usize,
        limits: FleetLimits,
    ) -> Result<Self> {
        let mapping = RankMapping::compute(nr_embedding, nr_batches, nr_rows, nr_cols, &limits)?;
        let fleet = FleetHandle::allocate(mapping.nr_pes(), limits)?;
        let stats = Arc::new(LookupStats::new());

        info!(
            fleet_id = %fleet.id(),
            nr_pes = mapping.nr_pes(),
            cols_per_pe = mapping.cols_per_pe(),
            "Embedding host ready"
        );
        Ok(Self {
            dispatcher: LookupDispatcher::new(&mapping).with_stats(Arc::clone(&stats)),
            merger: ResultMerger::new(),
            results: ResultBuffer::new(nr_embedding, 0, nr_cols),
            fleet,
            mapping,
            stats,
        })
    }

    pub fn fleet(&self) -> &FleetHandle {
        &self.fleet
    }

    pub fn mapping(&self) -> &RankMapping {
        &self.mapping
    }

    pub fn stats(&self) -> &Arc<LookupStats> {
        &self.stats
    }

    /// Distribute `tables` over the fleet. Required before the first lookup.
    pub async fn load_weights(&self, tables: &[EmbeddingTable]) -> Result<()> {
        loader::load_weights(&self.fleet, &self.mapping, tables).await
    }

    /// Look up one batch and return the descaled results.
    ///
    /// The returned buffer is overwritten by the next call.
    pub async fn lookup(&mut self, batch: &InputBatch) -> Result<&ResultBuffer> {
        let partials = self.dispatcher.lookup(&self.fleet, &self.mapping, batch).await?;
        let started = Instant::now();
        self.merger.merge(partials, &self.mapping, &mut self.results)?;
        self.stats.record_phase(Phase::Merge, started.elapsed());
        Ok(&self.results)
    }

    /// Stream `iterations` batches from `source` through a ring of `depth` slots
    pub async fn run_pipeline<S, K>(
        &self,
        source: S,
        iterations: usize,
        depth: usize,
        sink: &mut K,
    ) -> Result<PipelineReport>
    where
        S: BatchSource,
        K: ResultSink + ?Sized,
    {
        PipelineController::new(depth)
            .with_stats(Arc::clone(&self.stats))
            .run(&self.fleet, &self.mapping, source, iterations, sink)
            .await
    }

    /// Release the fleet
    pub fn release(self) -> Result<()> {
        self.stats.log_summary();
        self.fleet.release()
    }
}
