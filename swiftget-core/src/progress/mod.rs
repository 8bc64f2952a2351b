pub mod aggregator;
pub mod observer;
pub mod snapshot;

// Convenient re-exports
pub use aggregator::{ProgressAggregator, ProgressEvent};
pub use observer::ProgressObserver;
pub use snapshot::{format_bytes, ProgressSnapshot, SegmentSnapshot};
