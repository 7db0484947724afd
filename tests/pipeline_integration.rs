//! Pipeline backpressure and end-of-stream behaviour

use pim_embedding::pipeline::{BatchRing, DiscardSink};
use pim_embedding::{
    BatchSource, EmbeddingHost, EmbeddingInput, EmbeddingTable, FleetLimits, InputBatch, ResultBuffer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn limits() -> FleetLimits {
    FleetLimits {
        max_pes: 8,
        pe_memory_bytes: 16 * 1024,
        workers_per_pe: 2,
        transfer_alignment: 8,
        max_nr_batches: 4,
        max_indices: 16,
        max_cols_per_pe: 2,
    }
}

/// Bag `i` of every call is row `(call + i) % 4`
struct RowSource {
    calls: Arc<AtomicUsize>,
}

impl BatchSource for RowSource {
    fn fill(&mut self, batch: &mut InputBatch) -> pim_embedding::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
        for input in &mut batch.inputs {
            *input = EmbeddingInput::new(vec![call % 4, (call + 1) % 4], vec![0, 1]);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_producer_at_most_depth_ahead() {
    let (mut producer, mut consumer) = BatchRing::new(2, InputBatch::default).unwrap();
    let produced = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&produced);
    let task = tokio::spawn(async move {
        for _ in 0..5 {
            let mut slot = producer.reserve().await?;
            slot.batch_mut().valid = true;
            producer.release(slot)?;
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let mut slot = producer.reserve().await?;
        slot.batch_mut().valid = false;
        producer.release(slot)?;
        Ok::<_, pim_embedding::FleetError>(())
    });

    // consumer idle: the producer stalls on the third reserve
    sleep(Duration::from_millis(100)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 2);

    let slot = consumer.reserve().await.unwrap();
    consumer.release(slot).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 3);

    // drain the rest, including the sentinel
    let mut valid = 1;
    loop {
        let slot = consumer.reserve().await.unwrap();
        let sentinel = slot.is_sentinel();
        consumer.release(slot).unwrap();
        if sentinel {
            break;
        }
        valid += 1;
    }
    assert_eq!(valid, 5);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_stops_after_n_batches_and_sentinel() {
    let host = EmbeddingHost::with_limits(2, 2, 4, 2, limits()).unwrap();
    let tables: Vec<EmbeddingTable> = (0..2)
        .map(|e| EmbeddingTable::from_fn(4, 2, |r, c| (e * 100 + r * 10 + c) as i32))
        .collect();
    host.load_weights(&tables).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut sums = Vec::new();
    let mut sink = |_: usize, _: &InputBatch, results: &ResultBuffer| -> pim_embedding::Result<()> {
        sums.push((results.nr_batches(), results.get(0, 1, 0)));
        Ok(())
    };

    let report = timeout(
        Duration::from_secs(10),
        host.run_pipeline(RowSource { calls: Arc::clone(&calls) }, 7, 2, &mut sink),
    )
    .await
    .expect("pipeline terminates")
    .unwrap();

    assert_eq!(report.produced, 7);
    assert_eq!(report.processed, 7);
    assert_eq!(report.failed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 7);
    assert_eq!(sums.len(), 7);
    for (call, &(nr_batches, value)) in sums.iter().enumerate() {
        assert_eq!(nr_batches, 2);
        // embedding 0, bag 1 holds row (call + 1) % 4, column 0
        let raw = (((call + 1) % 4) * 10) as f32;
        assert!((value - raw * 1e-9).abs() < 1e-12);
    }
    host.release().unwrap();
}

#[tokio::test]
async fn test_deep_ring_finishes_short_run() {
    let host = EmbeddingHost::with_limits(1, 2, 4, 1, limits()).unwrap();
    host.load_weights(&[EmbeddingTable::from_fn(4, 1, |r, _| r as i32)])
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let report = timeout(
        Duration::from_secs(10),
        host.run_pipeline(RowSource { calls }, 1, 8, &mut DiscardSink),
    )
    .await
    .expect("pipeline terminates")
    .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(host.stats().total_lookups(), 1);
}
