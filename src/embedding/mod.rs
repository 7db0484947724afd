//! Host-side data model
//!
//! - [`EmbeddingTable`]: quantised weights of one table, row-major
//! - [`InputBatch`]: indices/offsets of one lookup call, per table
//! - [`ResultBuffer`]: descaled `[batch][col]` vectors per table
//! - [`PartialResults`]: raw per-PE fixed-point sums gathered from the fleet

pub mod batch;
pub mod results;
pub mod table;

pub use batch::{EmbeddingInput, InputBatch};
pub use results::{PartialResults, ResultBuffer};
pub use table::EmbeddingTable;
