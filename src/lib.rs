//! Host orchestration of sum-mode EmbeddingBag lookups on a PIM fleet
//!
//! Embedding tables are split column-wise across processing elements (PEs),
//! each PE reduces its columns for every bag of a call, and the host merges
//! the per-PE fixed-point partial sums back into float vectors.
//!
//! ```text
//! RankMapping ──▶ load_weights ──▶ LookupDispatcher ──▶ ResultMerger
//!                                        ▲
//!                     PipelineController ┘ (bounded batch ring)
//! ```

pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod errors;
pub mod fleet;
pub mod host;
pub mod loader;
pub mod mapping;
pub mod merge;
pub mod observability;
pub mod pipeline;
pub mod synthetic;
pub mod verify;

pub use config::{IndicesPerBatch, RunConfig};
pub use dispatch::{DispatchState, LookupDispatcher, LookupStats};
pub use embedding::{EmbeddingInput, EmbeddingTable, InputBatch, PartialResults, ResultBuffer};
pub use errors::{FleetError, Result};
pub use fleet::{FleetHandle, FleetLimits};
pub use host::EmbeddingHost;
pub use loader::{load_weights, read_back};
pub use mapping::{PeAssignment, RankMapping};
pub use merge::ResultMerger;
pub use observability::{init_logging, init_production_logging, init_simple_logging};
pub use pipeline::{BatchSource, PipelineController, PipelineReport, ResultSink};
pub use synthetic::{synthetic_tables, SyntheticSource};
pub use verify::{check_inference, VerificationReport};
