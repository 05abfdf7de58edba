//! Producer side: buffered send pipeline, flow control, delivery
//! reporting.

pub(crate) mod entry;
pub mod engine;
pub mod manager;
pub mod partitioner;

pub use engine::{DeliveryFuture, ProducerEngine, ProducerMessage};
pub use manager::{ProducerHandle, ProducerManager};
