//! Static capacities of one processing element
//!
//! These mirror the compile-time maxima the PE kernel is built with
//! (`MAX_NR_BATCHES`, `MAX_INDEX_PER_BATCH`, `MAX_NR_COLS_PER_DPU`) plus the
//! physical memory size and bulk-transfer granularity of the fleet.

use crate::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};

/// Bytes per quantised weight, index, offset and partial sum.
pub const WORD_BYTES: usize = 4;

/// Round `bytes` up to the next multiple of `alignment`.
#[inline]
pub fn align_up(bytes: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return bytes;
    }
    bytes.div_ceil(alignment) * alignment
}

/// Round `bytes` down to a multiple of `alignment`.
#[inline]
pub fn align_down(bytes: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return bytes;
    }
    bytes / alignment * alignment
}

/// Capacities shared by every PE in a fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetLimits {
    /// Largest fleet that can be allocated
    pub max_pes: usize,

    /// Private memory per PE in bytes
    pub pe_memory_bytes: usize,

    /// Identical parallel workers inside one PE
    pub workers_per_pe: usize,

    /// Every transfer size and symbol offset must be a multiple of this
    pub transfer_alignment: usize,

    /// Kernel capacity for bags per call
    pub max_nr_batches: usize,

    /// Kernel capacity for indices per call and embedding
    pub max_indices: usize,

    /// Kernel capacity for columns owned by one PE
    pub max_cols_per_pe: usize,
}

impl Default for FleetLimits {
    fn default() -> Self {
        Self {
            max_pes: 2560,
            pe_memory_bytes: 64 * 1024 * 1024,
            workers_per_pe: 16,
            transfer_alignment: 8,
            max_nr_batches: 256,
            max_indices: 32 * 1024,
            max_cols_per_pe: 16,
        }
    }
}

impl FleetLimits {
    /// Validate the limits before a fleet is allocated
    pub fn validate(&self) -> Result<()> {
        if self.max_pes == 0 {
            return Err(FleetError::Config("max_pes must be at least 1".into()));
        }
        if self.workers_per_pe == 0 {
            return Err(FleetError::Config(
                "workers_per_pe must be at least 1".into(),
            ));
        }
        if self.transfer_alignment == 0 || !self.transfer_alignment.is_power_of_two() {
            return Err(FleetError::Config(format!(
                "transfer_alignment must be a power of two, got {}",
                self.transfer_alignment
            )));
        }
        if self.max_nr_batches == 0 || self.max_indices == 0 || self.max_cols_per_pe == 0 {
            return Err(FleetError::Config(
                "kernel capacities must all be at least 1".into(),
            ));
        }
        if self.pe_memory_bytes % self.transfer_alignment != 0 {
            return Err(FleetError::Config(format!(
                "pe_memory_bytes ({}) must be a multiple of transfer_alignment ({})",
                self.pe_memory_bytes, self.transfer_alignment
            )));
        }
        Ok(())
    }

    /// Round a byte count up to the transfer alignment
    #[inline]
    pub fn align(&self, bytes: usize) -> usize {
        align_up(bytes, self.transfer_alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(12, 8), 16);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 8), 16);
    }

    #[test]
    fn test_default_limits_valid() {
        assert!(FleetLimits::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_alignment() {
        let limits = FleetLimits {
            transfer_alignment: 6,
            ..FleetLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let limits = FleetLimits {
            workers_per_pe: 0,
            ..FleetLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
