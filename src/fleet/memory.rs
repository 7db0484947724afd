//! Private memory of one processing element
//!
//! PE memory is addressed through named symbols exported by the kernel
//! image. The names are the wire contract with the kernel and must not
//! change.

use super::limits::{align_down, FleetLimits, WORD_BYTES};
use crate::errors::{FleetError, Result};
use std::fmt;

/// Size of the `{u64, u64}` descriptors (`input_lengths`, `emb_shape`)
pub const DESCRIPTOR_BYTES: usize = 16;

/// Named memory regions of the kernel image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// `{nr_rows, nr_cols_owned}` written once with the weights
    EmbShape,
    /// Column-major quantised weights, `[local_col][row]`
    EmbData,
    /// Row indices of the current call
    InputIndices,
    /// Bag start offsets of the current call
    InputOffsets,
    /// `{indices_len, nr_batches}` of the current call
    InputLengths,
    /// Partial sums, `[local_col][batch]`
    Results,
}

impl Symbol {
    pub const ALL: [Symbol; 6] = [
        Symbol::EmbShape,
        Symbol::EmbData,
        Symbol::InputIndices,
        Symbol::InputOffsets,
        Symbol::InputLengths,
        Symbol::Results,
    ];

    /// Name of the symbol in the kernel image
    pub fn name(&self) -> &'static str {
        match self {
            Symbol::EmbShape => "emb_shape",
            Symbol::EmbData => "emb_data",
            Symbol::InputIndices => "input_indices",
            Symbol::InputOffsets => "input_offsets",
            Symbol::InputLengths => "input_lengths",
            Symbol::Results => "results",
        }
    }

    /// Resolve a symbol by its kernel-image name
    pub fn from_name(name: &str) -> Option<Symbol> {
        Symbol::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capacity of every symbol, derived from the kernel's static maxima.
///
/// `emb_data` takes whatever memory the per-call regions leave over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    emb_shape: usize,
    emb_data: usize,
    input_indices: usize,
    input_offsets: usize,
    input_lengths: usize,
    results: usize,
}

impl SymbolTable {
    /// Lay out the kernel image for the given limits
    pub fn for_limits(limits: &FleetLimits) -> Result<Self> {
        let input_indices = limits.align(limits.max_indices * WORD_BYTES);
        let input_offsets = limits.align(limits.max_nr_batches * WORD_BYTES);
        let results = limits.align(limits.max_nr_batches * limits.max_cols_per_pe * WORD_BYTES);
        let emb_shape = limits.align(DESCRIPTOR_BYTES);
        let input_lengths = limits.align(DESCRIPTOR_BYTES);

        let reserved = input_indices + input_offsets + results + emb_shape + input_lengths;
        if reserved >= limits.pe_memory_bytes {
            return Err(FleetError::Config(format!(
                "per-call regions need {} bytes but a PE only has {}",
                reserved, limits.pe_memory_bytes
            )));
        }
        let emb_data = align_down(limits.pe_memory_bytes - reserved, limits.transfer_alignment);

        Ok(Self {
            emb_shape,
            emb_data,
            input_indices,
            input_offsets,
            input_lengths,
            results,
        })
    }

    /// Capacity of a symbol in bytes
    pub fn capacity(&self, symbol: Symbol) -> usize {
        match symbol {
            Symbol::EmbShape => self.emb_shape,
            Symbol::EmbData => self.emb_data,
            Symbol::InputIndices => self.input_indices,
            Symbol::InputOffsets => self.input_offsets,
            Symbol::InputLengths => self.input_lengths,
            Symbol::Results => self.results,
        }
    }
}

/// One capacity-bounded region.
///
/// Backing storage grows on first write so that idle PEs with large
/// `emb_data` capacities cost nothing on the host.
#[derive(Debug, Clone, Default)]
pub struct Region {
    capacity: usize,
    bytes: Vec<u8>,
}

impl Region {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check_bounds(&self, offset: usize, len: usize) -> std::result::Result<(), String> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(format!(
                "range {}..{} exceeds capacity {}",
                offset,
                offset.saturating_add(len),
                self.capacity
            )),
        }
    }

    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> std::result::Result<(), String> {
        self.check_bounds(offset, data.len())?;
        let end = offset + data.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read_into(&self, offset: usize, out: &mut [u8]) -> std::result::Result<(), String> {
        self.check_bounds(offset, out.len())?;
        // Never-written bytes read back as zero
        let written = self.bytes.len().saturating_sub(offset).min(out.len());
        if written > 0 {
            out[..written].copy_from_slice(&self.bytes[offset..offset + written]);
        }
        out[written..].fill(0);
        Ok(())
    }
}

/// Memory of one PE, one field per symbol so the kernel can borrow
/// regions independently.
#[derive(Debug, Clone)]
pub struct PeMemory {
    pub(crate) emb_shape: Region,
    pub(crate) emb_data: Region,
    pub(crate) input_indices: Region,
    pub(crate) input_offsets: Region,
    pub(crate) input_lengths: Region,
    pub(crate) results: Region,
}

impl PeMemory {
    pub fn new(symbols: &SymbolTable) -> Self {
        Self {
            emb_shape: Region::with_capacity(symbols.capacity(Symbol::EmbShape)),
            emb_data: Region::with_capacity(symbols.capacity(Symbol::EmbData)),
            input_indices: Region::with_capacity(symbols.capacity(Symbol::InputIndices)),
            input_offsets: Region::with_capacity(symbols.capacity(Symbol::InputOffsets)),
            input_lengths: Region::with_capacity(symbols.capacity(Symbol::InputLengths)),
            results: Region::with_capacity(symbols.capacity(Symbol::Results)),
        }
    }

    pub fn region(&self, symbol: Symbol) -> &Region {
        match symbol {
            Symbol::EmbShape => &self.emb_shape,
            Symbol::EmbData => &self.emb_data,
            Symbol::InputIndices => &self.input_indices,
            Symbol::InputOffsets => &self.input_offsets,
            Symbol::InputLengths => &self.input_lengths,
            Symbol::Results => &self.results,
        }
    }

    fn region_mut(&mut self, symbol: Symbol) -> &mut Region {
        match symbol {
            Symbol::EmbShape => &mut self.emb_shape,
            Symbol::EmbData => &mut self.emb_data,
            Symbol::InputIndices => &mut self.input_indices,
            Symbol::InputOffsets => &mut self.input_offsets,
            Symbol::InputLengths => &mut self.input_lengths,
            Symbol::Results => &mut self.results,
        }
    }

    /// Host → PE copy. Offset and length must respect `alignment`.
    pub fn write(
        &mut self,
        symbol: Symbol,
        offset: usize,
        data: &[u8],
        alignment: usize,
    ) -> Result<()> {
        check_alignment(symbol, offset, data.len(), alignment)?;
        self.region_mut(symbol)
            .write(offset, data)
            .map_err(|e| FleetError::TransferError(format!("{}: {}", symbol, e)))
    }

    /// PE → host copy. Offset and length must respect `alignment`.
    pub fn read_into(
        &self,
        symbol: Symbol,
        offset: usize,
        out: &mut [u8],
        alignment: usize,
    ) -> Result<()> {
        check_alignment(symbol, offset, out.len(), alignment)?;
        self.region(symbol)
            .read_into(offset, out)
            .map_err(|e| FleetError::TransferError(format!("{}: {}", symbol, e)))
    }
}

fn check_alignment(symbol: Symbol, offset: usize, len: usize, alignment: usize) -> Result<()> {
    if alignment > 1 && (offset % alignment != 0 || len % alignment != 0) {
        return Err(FleetError::TransferError(format!(
            "{}: offset {} / size {} not aligned to {} bytes",
            symbol, offset, len, alignment
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> FleetLimits {
        FleetLimits {
            max_pes: 4,
            pe_memory_bytes: 4096,
            workers_per_pe: 2,
            transfer_alignment: 8,
            max_nr_batches: 8,
            max_indices: 32,
            max_cols_per_pe: 2,
        }
    }

    #[test]
    fn test_symbol_names_roundtrip() {
        for symbol in Symbol::ALL {
            assert_eq!(Symbol::from_name(symbol.name()), Some(symbol));
        }
        assert_eq!(Symbol::from_name("emb_data"), Some(Symbol::EmbData));
        assert_eq!(Symbol::from_name("tmp_emb_data"), None);
    }

    #[test]
    fn test_symbol_table_layout() {
        let table = SymbolTable::for_limits(&small_limits()).unwrap();
        assert_eq!(table.capacity(Symbol::InputIndices), 128);
        assert_eq!(table.capacity(Symbol::InputOffsets), 32);
        assert_eq!(table.capacity(Symbol::Results), 64);
        assert_eq!(table.capacity(Symbol::InputLengths), 16);
        assert_eq!(table.capacity(Symbol::EmbShape), 16);
        assert_eq!(table.capacity(Symbol::EmbData), 4096 - 256);
    }

    #[test]
    fn test_symbol_table_rejects_tiny_memory() {
        let limits = FleetLimits {
            pe_memory_bytes: 128,
            ..small_limits()
        };
        assert!(SymbolTable::for_limits(&limits).is_err());
    }

    #[test]
    fn test_write_read_back() {
        let table = SymbolTable::for_limits(&small_limits()).unwrap();
        let mut mem = PeMemory::new(&table);
        mem.write(Symbol::InputOffsets, 8, &[1, 2, 3, 4, 5, 6, 7, 8], 8)
            .unwrap();

        let mut out = [0xffu8; 24];
        mem.read_into(Symbol::InputOffsets, 0, &mut out, 8).unwrap();
        assert_eq!(&out[..8], &[0; 8]);
        assert_eq!(&out[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&out[16..], &[0; 8]);
    }

    #[test]
    fn test_unaligned_transfer_rejected() {
        let table = SymbolTable::for_limits(&small_limits()).unwrap();
        let mut mem = PeMemory::new(&table);
        let err = mem.write(Symbol::InputIndices, 0, &[0; 12], 8).unwrap_err();
        assert!(matches!(err, FleetError::TransferError(_)));
    }

    #[test]
    fn test_out_of_capacity_rejected() {
        let table = SymbolTable::for_limits(&small_limits()).unwrap();
        let mut mem = PeMemory::new(&table);
        let err = mem.write(Symbol::InputOffsets, 0, &[0; 40], 8).unwrap_err();
        assert!(err.to_string().contains("input_offsets"));
    }
}
