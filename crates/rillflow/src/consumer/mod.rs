//! Consumer side: poll loop, partition fan-out, typed delivery, commit.

pub mod dispatch;
pub mod engine;
pub(crate) mod entry;
pub mod manager;
pub mod offsets;

pub use engine::ConsumerEngine;
pub use entry::ConsumerState;
pub use manager::{ConsumerHandle, ConsumerManager};
pub use offsets::OffsetTracker;
