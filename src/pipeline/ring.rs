//! Bounded ring of preallocated batch slots
//!
//! ```text
//!            ┌──── free (bounded D) ◀──── consumer.release ───┐
//! producer.reserve                                            │
//!      │ fill                                          consumer.reserve
//!      └── producer.release ──▶ filled (bounded D) ───────────┘
//! ```
//!
//! Exactly `D` slots exist, so a release never waits and a producer that
//! runs `D` batches ahead blocks in `reserve` until the consumer frees one.

use crate::embedding::InputBatch;
use crate::errors::{FleetError, Result};
use tokio::sync::mpsc;
use tracing::trace;

/// Smallest depth that lets the producer fill one slot while the
/// consumer works on another
pub const MIN_DEPTH: usize = 2;

/// Owned access to one slot. Only the holder can read or write the batch.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    batch: InputBatch,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn batch(&self) -> &InputBatch {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut InputBatch {
        &mut self.batch
    }

    pub fn is_sentinel(&self) -> bool {
        !self.batch.valid
    }
}

/// Constructor for the two ring ends
pub struct BatchRing;

impl BatchRing {
    /// Create a ring of `depth` slots, each initialised by `make_slot`
    pub fn new(depth: usize, mut make_slot: impl FnMut() -> InputBatch) -> Result<(RingProducer, RingConsumer)> {
        if depth < MIN_DEPTH {
            return Err(FleetError::Config(format!(
                "pipeline depth must be at least {}, got {}",
                MIN_DEPTH, depth
            )));
        }

        let (free_tx, free_rx) = mpsc::channel(depth);
        let (filled_tx, filled_rx) = mpsc::channel(depth);
        for index in 0..depth {
            free_tx
                .try_send(Slot {
                    index,
                    batch: make_slot(),
                })
                .map_err(|_| FleetError::Pipeline("ring initialisation overflowed".to_string()))?;
        }

        Ok((
            RingProducer {
                free: free_rx,
                filled: filled_tx,
            },
            RingConsumer {
                filled: filled_rx,
                free: free_tx,
                depth,
            },
        ))
    }
}

/// Producer end: takes free slots, hands back filled ones
#[derive(Debug)]
pub struct RingProducer {
    free: mpsc::Receiver<Slot>,
    filled: mpsc::Sender<Slot>,
}

impl RingProducer {
    /// Wait for a free slot
    pub async fn reserve(&mut self) -> Result<Slot> {
        let slot = self
            .free
            .recv()
            .await
            .ok_or_else(|| FleetError::Pipeline("consumer dropped the ring".to_string()))?;
        trace!(slot = slot.index, "Producer reserved slot");
        Ok(slot)
    }

    /// Publish a filled slot to the consumer
    pub fn release(&self, slot: Slot) -> Result<()> {
        trace!(slot = slot.index, valid = slot.batch.valid, "Producer released slot");
        self.filled
            .try_send(slot)
            .map_err(|_| FleetError::Pipeline("consumer dropped the ring".to_string()))
    }
}

/// Consumer end: takes filled slots, hands back free ones
#[derive(Debug)]
pub struct RingConsumer {
    filled: mpsc::Receiver<Slot>,
    free: mpsc::Sender<Slot>,
    depth: usize,
}

impl RingConsumer {
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Wait for the next filled slot, in production order
    pub async fn reserve(&mut self) -> Result<Slot> {
        let slot = self
            .filled
            .recv()
            .await
            .ok_or_else(|| FleetError::Pipeline("producer stopped before the sentinel".to_string()))?;
        trace!(slot = slot.index, "Consumer reserved slot");
        Ok(slot)
    }

    /// Return a slot to the producer
    pub fn release(&self, slot: Slot) -> Result<()> {
        trace!(slot = slot.index, "Consumer released slot");
        match self.free.try_send(slot) {
            Ok(()) => Ok(()),
            // producer already finished after its sentinel
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(FleetError::Pipeline("more slots released than the ring holds".to_string()))
            }
        }
    }
}
