//! Device-side engine thread
//!
//! Submitted operations are executed strictly in submission order. The first
//! failure after a `Sync` is remembered, every later operation is skipped,
//! and the failure is reported by the next `Sync`.

use super::kernel;
use super::limits::FleetLimits;
use super::memory::{PeMemory, Symbol, SymbolTable};
use crate::errors::{FleetError, Result};
use rayon::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// One operation queued for the fleet
pub(crate) enum FleetCommand {
    /// Bulk host → PE transfer, one buffer per PE, common size
    Push {
        symbol: Symbol,
        offset: usize,
        size: usize,
        buffers: Vec<Arc<[u8]>>,
    },
    /// Bulk PE → host transfer into caller-provided buffers
    Pull {
        symbol: Symbol,
        offset: usize,
        size: usize,
        buffers: Vec<Vec<u8>>,
        reply: oneshot::Sender<Vec<Vec<u8>>>,
    },
    /// Single-PE host → PE copy
    CopyTo {
        pe: usize,
        symbol: Symbol,
        offset: usize,
        data: Vec<u8>,
    },
    /// Single-PE PE → host copy
    CopyFrom {
        pe: usize,
        symbol: Symbol,
        offset: usize,
        len: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// Run the kernel on every PE
    Launch,
    /// Join point for everything submitted before it
    Sync { reply: oneshot::Sender<Result<()>> },
}

fn rejected_by(pe: usize, err: FleetError) -> FleetError {
    match err {
        FleetError::TransferError(msg) => {
            FleetError::TransferError(format!("PE {} rejected {}", pe, msg))
        }
        other => other,
    }
}

pub(crate) struct Engine {
    memories: Vec<PeMemory>,
    limits: FleetLimits,
    pending: Option<FleetError>,
}

impl Engine {
    pub(crate) fn new(nr_pes: usize, limits: FleetLimits, symbols: &SymbolTable) -> Self {
        Self {
            memories: (0..nr_pes).map(|_| PeMemory::new(symbols)).collect(),
            limits,
            pending: None,
        }
    }

    /// Drain commands until every sender is gone
    pub(crate) fn run(mut self, mut commands: mpsc::UnboundedReceiver<FleetCommand>) {
        debug!(nr_pes = self.memories.len(), "Fleet engine started");
        while let Some(command) = commands.blocking_recv() {
            self.execute(command);
        }
        debug!("Fleet engine stopped");
    }

    fn execute(&mut self, command: FleetCommand) {
        if let FleetCommand::Sync { reply } = command {
            let outcome = match self.pending.take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            let _ = reply.send(outcome);
            return;
        }

        if self.pending.is_some() {
            trace!("Skipping operation after earlier failure");
            return;
        }

        let outcome = match command {
            FleetCommand::Push {
                symbol,
                offset,
                size,
                buffers,
            } => self.push(symbol, offset, size, &buffers),
            FleetCommand::Pull {
                symbol,
                offset,
                size,
                buffers,
                reply,
            } => self.pull(symbol, offset, size, buffers).map(|filled| {
                let _ = reply.send(filled);
            }),
            FleetCommand::CopyTo {
                pe,
                symbol,
                offset,
                data,
            } => self.memory_mut(pe).and_then(|(mem, alignment)| {
                mem.write(symbol, offset, &data, alignment)
                    .map_err(|e| rejected_by(pe, e))
            }),
            FleetCommand::CopyFrom {
                pe,
                symbol,
                offset,
                len,
                reply,
            } => self.copy_from(pe, symbol, offset, len).map(|data| {
                let _ = reply.send(data);
            }),
            FleetCommand::Launch => self.launch(),
            FleetCommand::Sync { .. } => Ok(()),
        };

        if let Err(err) = outcome {
            warn!(error = %err, "Fleet operation failed");
            self.pending = Some(err);
        }
    }

    fn memory_mut(&mut self, pe: usize) -> Result<(&mut PeMemory, usize)> {
        let alignment = self.limits.transfer_alignment;
        let nr_pes = self.memories.len();
        self.memories
            .get_mut(pe)
            .map(|mem| (mem, alignment))
            .ok_or_else(|| FleetError::TransferError(format!("PE {} not in fleet of {}", pe, nr_pes)))
    }

    fn check_buffer_count(&self, symbol: Symbol, count: usize) -> Result<()> {
        if count != self.memories.len() {
            return Err(FleetError::TransferError(format!(
                "{}: {} buffers prepared for {} PEs",
                symbol,
                count,
                self.memories.len()
            )));
        }
        Ok(())
    }

    fn push(&mut self, symbol: Symbol, offset: usize, size: usize, buffers: &[Arc<[u8]>]) -> Result<()> {
        self.check_buffer_count(symbol, buffers.len())?;
        let alignment = self.limits.transfer_alignment;
        trace!(%symbol, offset, size, "Push");

        self.memories
            .par_iter_mut()
            .zip(buffers.par_iter())
            .enumerate()
            .try_for_each(|(pe, (mem, buffer))| {
                if buffer.len() < size {
                    return Err(FleetError::TransferError(format!(
                        "PE {} {}: buffer of {} bytes shorter than transfer size {}",
                        pe,
                        symbol,
                        buffer.len(),
                        size
                    )));
                }
                mem.write(symbol, offset, &buffer[..size], alignment)
                    .map_err(|e| rejected_by(pe, e))
            })
    }

    fn pull(
        &mut self,
        symbol: Symbol,
        offset: usize,
        size: usize,
        mut buffers: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>> {
        self.check_buffer_count(symbol, buffers.len())?;
        let alignment = self.limits.transfer_alignment;
        trace!(%symbol, offset, size, "Pull");

        self.memories
            .par_iter()
            .zip(buffers.par_iter_mut())
            .enumerate()
            .try_for_each(|(pe, (mem, buffer))| {
                buffer.resize(size, 0);
                mem.read_into(symbol, offset, buffer, alignment)
                    .map_err(|e| rejected_by(pe, e))
            })?;
        Ok(buffers)
    }

    fn copy_from(&mut self, pe: usize, symbol: Symbol, offset: usize, len: usize) -> Result<Vec<u8>> {
        let (mem, alignment) = self.memory_mut(pe)?;
        let mut out = vec![0u8; len];
        mem.read_into(symbol, offset, &mut out, alignment)
            .map_err(|e| rejected_by(pe, e))?;
        Ok(out)
    }

    fn launch(&mut self) -> Result<()> {
        let limits = &self.limits;
        trace!(nr_pes = self.memories.len(), "Launch");
        self.memories
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(pe, mem)| kernel::run(pe, mem, limits))
    }
}
