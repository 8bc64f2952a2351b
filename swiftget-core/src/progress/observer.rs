use async_trait::async_trait;
use super::snapshot::ProgressSnapshot;

/// Trait for anything that wants to observe transfer progress.
///
/// The `ProgressAggregator` calls these methods on all registered observers
/// after folding raw byte-count events into a `ProgressSnapshot`.
///
/// Lifecycle:
/// - `on_progress` is called at most every 100ms, even if
///   many events arrived in between.
/// - `on_complete` is called once when every segment is marked complete.
/// - `on_error` is called once when the transfer fails.
#[async_trait]
pub trait ProgressObserver: Send + Sync + 'static {
    /// Called with the latest aggregated snapshot, rate-limited to at most
    /// once per 100ms.
    async fn on_progress(&self, snapshot: &ProgressSnapshot);

    /// Called once when the transfer completes successfully.
    async fn on_complete(&self, snapshot: &ProgressSnapshot);

    /// Called once when the transfer fails.
    async fn on_error(&self, error: &str);
}
