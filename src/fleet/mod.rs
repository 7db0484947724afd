//! Fleet of processing elements
//!
//! A [`FleetHandle`] owns every PE allocated for one run. There is no
//! ambient fleet: the handle is passed explicitly to the weight loader and
//! the dispatcher, so several independent fleets can live in one process.
//!
//! ## Transfer model
//!
//! ```text
//! host                         engine thread (in order)
//! ────                         ────────────────────────
//! push(indices)   ──submit──▶  write every PE
//! push(offsets)   ──submit──▶  write every PE
//! launch()        ──submit──▶  kernel on every PE
//! pull(results)   ──submit──▶  read every PE ──▶ PendingPull
//! sync().await    ──submit──▶  report first failure
//! ```
//!
//! Submissions never block. `sync` is the only join point; pulled buffers
//! are only valid after it returned `Ok`.

mod engine;
pub mod kernel;
pub mod limits;
pub mod memory;

pub use kernel::{EmbShape, QueryLengths};
pub use limits::{align_up, FleetLimits, WORD_BYTES};
pub use memory::{Symbol, SymbolTable, DESCRIPTOR_BYTES};

use crate::errors::{FleetError, Result};
use engine::{Engine, FleetCommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use uuid::Uuid;

/// Gathered buffers that become readable after the next successful sync
#[derive(Debug)]
pub struct PendingPull {
    rx: oneshot::Receiver<Vec<Vec<u8>>>,
}

impl PendingPull {
    /// Take the gathered buffers. Call only after `sync` succeeded.
    pub async fn wait(self) -> Result<Vec<Vec<u8>>> {
        self.rx
            .await
            .map_err(|_| FleetError::DispatchError("gather abandoned by the fleet".to_string()))
    }
}

/// Handle to an allocated fleet
pub struct FleetHandle {
    id: Uuid,
    nr_pes: usize,
    limits: FleetLimits,
    symbols: SymbolTable,
    commands: Option<mpsc::UnboundedSender<FleetCommand>>,
    engine: Option<thread::JoinHandle<()>>,
    poisoned: AtomicBool,
}

impl FleetHandle {
    /// Allocate `nr_pes` PEs and load the kernel image into each of them
    pub fn allocate(nr_pes: usize, limits: FleetLimits) -> Result<Self> {
        limits.validate()?;
        if nr_pes == 0 || nr_pes > limits.max_pes {
            return Err(FleetError::CapacityExceeded(format!(
                "cannot allocate {} PEs (fleet supports 1..={})",
                nr_pes, limits.max_pes
            )));
        }
        let symbols = SymbolTable::for_limits(&limits)?;
        let id = Uuid::new_v4();

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(nr_pes, limits.clone(), &symbols);
        let handle = thread::Builder::new()
            .name(format!("pim-fleet-{}", &id.to_string()[..8]))
            .spawn(move || engine.run(rx))?;

        info!(
            fleet_id = %id,
            nr_pes,
            pe_memory_bytes = limits.pe_memory_bytes,
            emb_data_bytes = symbols.capacity(Symbol::EmbData),
            workers_per_pe = limits.workers_per_pe,
            "Fleet allocated"
        );

        Ok(Self {
            id,
            nr_pes,
            limits,
            symbols,
            commands: Some(tx),
            engine: Some(handle),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn nr_pes(&self) -> usize {
        self.nr_pes
    }

    pub fn limits(&self) -> &FleetLimits {
        &self.limits
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Round a transfer size up to the fleet's alignment
    pub fn align(&self, bytes: usize) -> usize {
        self.limits.align(bytes)
    }

    /// Whether a transfer failure left PE memory undefined
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(fleet_id = %self.id, "Fleet poisoned, PE memory state is undefined");
        }
    }

    fn submit(&self, command: FleetCommand) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| FleetError::DispatchError("fleet already released".to_string()))?
            .send(command)
            .map_err(|_| FleetError::DispatchError("fleet engine is gone".to_string()))
    }

    /// Queue a bulk transfer of `size` bytes from `buffers[pe]` into every PE.
    ///
    /// PEs that must receive identical data can share one buffer.
    pub fn push(&self, symbol: Symbol, offset: usize, size: usize, buffers: Vec<Arc<[u8]>>) -> Result<()> {
        self.submit(FleetCommand::Push {
            symbol,
            offset,
            size,
            buffers,
        })
    }

    /// Queue a bulk transfer of `size` bytes from every PE into `buffers`.
    ///
    /// The buffers are handed back by [`PendingPull::wait`] so they can be
    /// reused by the next call.
    pub fn pull(
        &self,
        symbol: Symbol,
        offset: usize,
        size: usize,
        buffers: Vec<Vec<u8>>,
    ) -> Result<PendingPull> {
        let (reply, rx) = oneshot::channel();
        self.submit(FleetCommand::Pull {
            symbol,
            offset,
            size,
            buffers,
            reply,
        })?;
        Ok(PendingPull { rx })
    }

    /// Queue a collective launch of the kernel on every PE
    pub fn launch(&self) -> Result<()> {
        self.submit(FleetCommand::Launch)
    }

    /// Wait until everything submitted so far has completed.
    ///
    /// Returns the first failure since the previous sync. Transfer failures
    /// poison the fleet.
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(FleetCommand::Sync { reply })?;
        let outcome = rx
            .await
            .map_err(|_| FleetError::DispatchError("fleet engine stopped during sync".to_string()))?;
        if let Err(FleetError::TransferError(_)) = &outcome {
            self.poison();
        }
        outcome
    }

    /// Synchronous copy into one PE
    pub async fn copy_to(&self, pe: usize, symbol: Symbol, offset: usize, data: Vec<u8>) -> Result<()> {
        self.submit(FleetCommand::CopyTo {
            pe,
            symbol,
            offset,
            data,
        })?;
        self.sync().await
    }

    /// Synchronous copy out of one PE
    pub async fn copy_from(&self, pe: usize, symbol: Symbol, offset: usize, len: usize) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(FleetCommand::CopyFrom {
            pe,
            symbol,
            offset,
            len,
            reply,
        })?;
        self.sync().await?;
        rx.await
            .map_err(|_| FleetError::DispatchError("copy abandoned by the fleet".to_string()))
    }

    /// Release every PE and stop the engine
    pub fn release(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        drop(self.commands.take());
        if let Some(engine) = self.engine.take() {
            engine
                .join()
                .map_err(|_| FleetError::DispatchError("fleet engine panicked".to_string()))?;
            info!(fleet_id = %self.id, "Fleet released");
        }
        Ok(())
    }
}

impl Drop for FleetHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(fleet_id = %self.id, error = %e, "Fleet release failed");
        }
    }
}

impl std::fmt::Debug for FleetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetHandle")
            .field("id", &self.id)
            .field("nr_pes", &self.nr_pes)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(buffers: &[Vec<u8>]) -> Vec<Arc<[u8]>> {
        buffers.iter().map(|b| Arc::from(b.as_slice())).collect()
    }

    fn test_limits() -> FleetLimits {
        FleetLimits {
            max_pes: 8,
            pe_memory_bytes: 4096,
            workers_per_pe: 2,
            transfer_alignment: 8,
            max_nr_batches: 8,
            max_indices: 32,
            max_cols_per_pe: 2,
        }
    }

    #[test]
    fn test_allocate_rejects_oversized_fleet() {
        let err = FleetHandle::allocate(9, test_limits()).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded(_)));
        assert!(FleetHandle::allocate(0, test_limits()).is_err());
    }

    #[tokio::test]
    async fn test_push_then_copy_from() {
        let fleet = FleetHandle::allocate(3, test_limits()).unwrap();
        let buffers: Vec<Arc<[u8]>> = (0..3).map(|pe| Arc::from(vec![pe as u8 + 1; 16])).collect();
        fleet.push(Symbol::InputOffsets, 0, 16, buffers).unwrap();
        fleet.sync().await.unwrap();

        for pe in 0..3 {
            let data = fleet.copy_from(pe, Symbol::InputOffsets, 0, 16).await.unwrap();
            assert_eq!(data, vec![pe as u8 + 1; 16]);
        }
        fleet.release().unwrap();
    }

    #[tokio::test]
    async fn test_pull_returns_buffers_after_sync() {
        let fleet = FleetHandle::allocate(2, test_limits()).unwrap();
        fleet
            .push(Symbol::Results, 0, 8, shared(&[vec![7; 8], vec![9; 8]]))
            .unwrap();
        let pending = fleet.pull(Symbol::Results, 0, 8, vec![Vec::new(), Vec::new()]).unwrap();
        fleet.sync().await.unwrap();

        let gathered = pending.wait().await.unwrap();
        assert_eq!(gathered, vec![vec![7; 8], vec![9; 8]]);
    }

    #[tokio::test]
    async fn test_unaligned_push_poisons_fleet() {
        let fleet = FleetHandle::allocate(2, test_limits()).unwrap();
        fleet
            .push(Symbol::InputIndices, 0, 12, shared(&[vec![0; 12], vec![0; 12]]))
            .unwrap();
        let err = fleet.sync().await.unwrap_err();
        assert!(matches!(err, FleetError::TransferError(_)));
        assert!(fleet.is_poisoned());
    }

    #[tokio::test]
    async fn test_failure_skips_later_operations() {
        let fleet = FleetHandle::allocate(2, test_limits()).unwrap();
        // wrong buffer count fails the first push
        fleet.push(Symbol::InputOffsets, 0, 8, shared(&[vec![1; 8]])).unwrap();
        fleet
            .push(Symbol::InputOffsets, 0, 8, shared(&[vec![2; 8], vec![2; 8]]))
            .unwrap();
        assert!(fleet.sync().await.is_err());

        // the second push never ran
        let data = fleet.copy_from(0, Symbol::InputOffsets, 0, 8).await.unwrap();
        assert_eq!(data, vec![0; 8]);
    }

    #[tokio::test]
    async fn test_launch_without_weights_is_dispatch_error() {
        let fleet = FleetHandle::allocate(1, test_limits()).unwrap();
        fleet.launch().unwrap();
        let err = fleet.sync().await.unwrap_err();
        assert!(matches!(err, FleetError::DispatchError(_)));
        assert!(!fleet.is_poisoned());
    }

    #[tokio::test]
    async fn test_independent_fleets() {
        let a = FleetHandle::allocate(1, test_limits()).unwrap();
        let b = FleetHandle::allocate(1, test_limits()).unwrap();
        a.copy_to(0, Symbol::InputOffsets, 0, vec![5; 8]).await.unwrap();
        let from_b = b.copy_from(0, Symbol::InputOffsets, 0, 8).await.unwrap();
        assert_eq!(from_b, vec![0; 8]);
        assert_ne!(a.id(), b.id());
    }
}
