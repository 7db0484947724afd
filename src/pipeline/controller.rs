use super::ring::{BatchRing, RingConsumer, RingProducer};
use crate::dispatch::{LookupDispatcher, LookupStats, Phase};
use crate::embedding::{InputBatch, ResultBuffer};
use crate::errors::{FleetError, Result};
use crate::fleet::FleetHandle;
use crate::mapping::RankMapping;
use crate::merge::ResultMerger;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fills pipeline slots with lookup requests.
///
/// `fill` receives a slot that may still hold the previous request and
/// must overwrite it completely.
pub trait BatchSource: Send + 'static {
    fn fill(&mut self, batch: &mut InputBatch) -> Result<()>;
}

/// Receives every merged result, in production order
pub trait ResultSink {
    fn consume(&mut self, iteration: usize, batch: &InputBatch, results: &ResultBuffer) -> Result<()>;
}

impl<F> ResultSink for F
where
    F: FnMut(usize, &InputBatch, &ResultBuffer) -> Result<()>,
{
    fn consume(&mut self, iteration: usize, batch: &InputBatch, results: &ResultBuffer) -> Result<()> {
        self(iteration, batch, results)
    }
}

/// Sink that drops every result
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl ResultSink for DiscardSink {
    fn consume(&mut self, _: usize, _: &InputBatch, _: &ResultBuffer) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Valid batches published by the producer
    pub produced: usize,
    /// Batches dispatched, merged and handed to the sink
    pub processed: usize,
    /// Batches whose lookup failed without invalidating the fleet
    pub failed: usize,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn batches_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Overlaps batch preparation with device lookups over a [`BatchRing`]
pub struct PipelineController {
    depth: usize,
    stats: Arc<LookupStats>,
}

impl PipelineController {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            stats: Arc::new(LookupStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<LookupStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<LookupStats> {
        &self.stats
    }

    /// Run `iterations` lookups from `source`, then stop on the sentinel.
    ///
    /// Lookup failures that leave the fleet usable are counted and
    /// skipped; any other failure stops both tasks and is returned.
    pub async fn run<S, K>(
        &self,
        fleet: &FleetHandle,
        mapping: &RankMapping,
        source: S,
        iterations: usize,
        sink: &mut K,
    ) -> Result<PipelineReport>
    where
        S: BatchSource,
        K: ResultSink + ?Sized,
    {
        let started = Instant::now();
        let nr_embedding = mapping.nr_embedding();
        let nr_batches = mapping.batch_capacity();
        let max_indices = fleet.limits().max_indices;
        let (producer, consumer) = BatchRing::new(self.depth, || {
            InputBatch::with_capacity(nr_embedding, nr_batches, max_indices)
        })?;

        info!(depth = self.depth, iterations, nr_pes = mapping.nr_pes(), "Pipeline started");
        let producer_task = spawn_producer(producer, source, iterations);

        let consumed = self.consume(fleet, mapping, consumer, sink).await;
        let produced = join_producer(producer_task).await;

        let ((processed, failed), produced) = match (consumed, produced) {
            // the consumer only saw the ring close; the producer holds the cause
            (Err(FleetError::Pipeline(symptom)), Err(cause)) => {
                error!(error = %cause, consumer = %symptom, "Pipeline producer stopped");
                return Err(cause);
            }
            (Err(e), produced) => {
                if let Err(producer) = produced {
                    error!(error = %producer, "Pipeline producer stopped");
                }
                error!(error = %e, "Pipeline consumer stopped");
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                error!(error = %e, "Pipeline producer stopped");
                return Err(e);
            }
            (Ok(counts), Ok(produced)) => (counts, produced),
        };

        let report = PipelineReport {
            produced,
            processed,
            failed,
            elapsed: started.elapsed(),
        };
        info!(
            processed = report.processed,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pipeline finished"
        );
        Ok(report)
    }

    /// Returns `(processed, failed)` once the sentinel was released
    async fn consume<K>(
        &self,
        fleet: &FleetHandle,
        mapping: &RankMapping,
        mut consumer: RingConsumer,
        sink: &mut K,
    ) -> Result<(usize, usize)>
    where
        K: ResultSink + ?Sized,
    {
        let mut dispatcher = LookupDispatcher::new(mapping).with_stats(Arc::clone(&self.stats));
        let merger = ResultMerger::new();
        let mut results = ResultBuffer::new(mapping.nr_embedding(), 0, mapping.nr_cols());
        let (mut processed, mut failed) = (0, 0);

        loop {
            let slot = consumer.reserve().await?;
            if slot.is_sentinel() {
                debug!(slot = slot.index(), "Sentinel reached");
                consumer.release(slot)?;
                return Ok((processed, failed));
            }

            let iteration = processed + failed;
            match dispatcher.lookup(fleet, mapping, slot.batch()).await {
                Ok(partials) => {
                    let merge_started = Instant::now();
                    merger.merge(partials, mapping, &mut results)?;
                    self.stats.record_phase(Phase::Merge, merge_started.elapsed());
                    sink.consume(iteration, slot.batch(), &results)?;
                    processed += 1;
                }
                Err(e) if !e.is_fatal_for_fleet() => {
                    warn!(iteration, error = %e, "Skipping failed lookup");
                    failed += 1;
                }
                Err(e) => return Err(e),
            }
            consumer.release(slot)?;
        }
    }
}

fn spawn_producer<S: BatchSource>(
    mut producer: RingProducer,
    mut source: S,
    iterations: usize,
) -> JoinHandle<Result<usize>> {
    tokio::spawn(async move {
        for iteration in 0..iterations {
            let mut slot = producer.reserve().await?;
            source.fill(slot.batch_mut())?;
            slot.batch_mut().valid = true;
            debug!(iteration, slot = slot.index(), "Batch produced");
            producer.release(slot)?;
        }

        let mut slot = producer.reserve().await?;
        slot.batch_mut().valid = false;
        producer.release(slot)?;
        Ok(iterations)
    })
}

async fn join_producer(task: JoinHandle<Result<usize>>) -> Result<usize> {
    task.await
        .map_err(|e| FleetError::Pipeline(format!("producer task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingInput, EmbeddingTable};
    use crate::fleet::FleetLimits;
    use crate::loader::load_weights;

    /// Every batch looks up row `iteration % nr_rows` once per bag
    struct CountingSource {
        nr_rows: u32,
        next: u32,
    }

    impl BatchSource for CountingSource {
        fn fill(&mut self, batch: &mut InputBatch) -> Result<()> {
            let row = self.next % self.nr_rows;
            self.next += 1;
            for input in &mut batch.inputs {
                input.indices.clear();
                input.offsets.clear();
                input.indices.extend([row, row]);
                input.offsets.extend([0, 1]);
            }
            Ok(())
        }
    }

    struct FailingSource;

    impl BatchSource for FailingSource {
        fn fill(&mut self, _: &mut InputBatch) -> Result<()> {
            Err(FleetError::InvalidBatch("source exhausted".to_string()))
        }
    }

    async fn setup() -> (FleetHandle, RankMapping) {
        let limits = FleetLimits {
            max_pes: 8,
            pe_memory_bytes: 16 * 1024,
            workers_per_pe: 2,
            max_nr_batches: 4,
            max_indices: 16,
            ..FleetLimits::default()
        };
        let tables: Vec<EmbeddingTable> = (0..2)
            .map(|e| EmbeddingTable::from_fn(8, 2, |r, c| (e * 100 + r * 10 + c) as i32))
            .collect();
        let mapping = RankMapping::compute(2, 2, 8, 2, &limits).unwrap();
        let fleet = FleetHandle::allocate(mapping.nr_pes(), limits).unwrap();
        load_weights(&fleet, &mapping, &tables).await.unwrap();
        (fleet, mapping)
    }

    #[tokio::test]
    async fn test_run_processes_every_batch_in_order() {
        let (fleet, mapping) = setup().await;
        let controller = PipelineController::new(2);
        let mut seen = Vec::new();
        let mut sink = |iteration: usize, _: &InputBatch, results: &ResultBuffer| -> Result<()> {
            seen.push((iteration, results.get(1, 0, 1)));
            Ok(())
        };

        let report = controller
            .run(&fleet, &mapping, CountingSource { nr_rows: 8, next: 0 }, 5, &mut sink)
            .await
            .unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(seen.len(), 5);
        for (i, (iteration, value)) in seen.iter().enumerate() {
            assert_eq!(*iteration, i);
            // embedding 1, bag 0 (one index), column 1
            let raw = 100 + (i as i32 % 8) * 10 + 1;
            assert!((value - raw as f32 * 1e-9).abs() < 1e-12);
        }
        assert_eq!(controller.stats().total_lookups(), 5);
    }

    #[tokio::test]
    async fn test_zero_iterations_only_sentinel() {
        let (fleet, mapping) = setup().await;
        let report = PipelineController::new(2)
            .run(&fleet, &mapping, CountingSource { nr_rows: 8, next: 0 }, 0, &mut DiscardSink)
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_source_failure_stops_pipeline() {
        let (fleet, mapping) = setup().await;
        let err = PipelineController::new(3)
            .run(&fleet, &mapping, FailingSource, 4, &mut DiscardSink)
            .await
            .unwrap_err();
        match err {
            FleetError::InvalidBatch(msg) => assert_eq!(msg, "source exhausted"),
            other => panic!("expected the source error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_failure_wins_over_closed_ring() {
        let (fleet, mapping) = setup().await;
        let mut sink = |_: usize, _: &InputBatch, _: &ResultBuffer| -> Result<()> {
            Err(FleetError::Config("sink full".to_string()))
        };
        let err = PipelineController::new(2)
            .run(&fleet, &mapping, CountingSource { nr_rows: 8, next: 0 }, 6, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[tokio::test]
    async fn test_depth_one_rejected() {
        let (fleet, mapping) = setup().await;
        let err = PipelineController::new(1)
            .run(&fleet, &mapping, FailingSource, 1, &mut DiscardSink)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_batch_is_counted_and_skipped() {
        struct OutOfRange;
        impl BatchSource for OutOfRange {
            fn fill(&mut self, batch: &mut InputBatch) -> Result<()> {
                for input in &mut batch.inputs {
                    *input = EmbeddingInput::new(vec![99], vec![0]);
                }
                Ok(())
            }
        }

        let (fleet, mapping) = setup().await;
        let report = PipelineController::new(2)
            .run(&fleet, &mapping, OutOfRange, 3, &mut DiscardSink)
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 3);
        assert!(!fleet.is_poisoned());
    }
}
