//! Producer/consumer pipeline over a bounded slot ring
//!
//! The producer task fills slots with lookup requests while the consumer
//! dispatches the previous one. After `N` valid batches the producer
//! publishes a single invalid sentinel; the consumer releases it and stops.

pub mod controller;
pub mod ring;

pub use controller::{BatchSource, DiscardSink, PipelineController, PipelineReport, ResultSink};
pub use ring::{BatchRing, RingConsumer, RingProducer, Slot, MIN_DEPTH};
