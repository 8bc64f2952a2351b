//! Fan-in of `(segment_index, bytes_added)` events from N concurrent
//! segment tasks; produces current/average speed and ETA, and rate-limits
//! display updates. Generalizes the `ProgressNotifier` pattern: same EMA
//! speed smoothing, extended with peak/avg bps and a 100ms coalescing rate
//! limit instead of emitting on every event.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::{ProgressSnapshot, SegmentSnapshot};

/// One raw progress report from a `SegmentDownloader`.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub segment_index: u64,
    pub bytes_delta: u64,
    pub total_bytes: Option<u64>,
}

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;
/// Emit a display update at most this often.
const DISPLAY_INTERVAL: Duration = Duration::from_millis(100);

struct SegmentProgress {
    segment_index: u64,
    bytes_downloaded: u64,
    total_bytes: u64,
    speed: f64,
    last_update: Instant,
    completed: bool,
}

/// Consumes `Result<ProgressEvent, String>` from the download channel,
/// aggregates progress into `ProgressSnapshot`s, and fans out to all
/// registered observers. One instance per transfer; thread-safe for
/// concurrent producers because all mutation happens inside the single
/// `run()` task that owns the channel receiver.
///
/// | Channel message        | Observer method called         |
/// |-------------------------|--------------------------------|
/// | `Ok(ProgressEvent)`     | `on_progress(&snapshot)` (rate-limited) |
/// | `Err(String)`           | `on_error(&msg)` then stops    |
/// | Channel closed (no err) | `on_complete(&final_snapshot)` |
pub struct ProgressAggregator {
    observers: Vec<Box<dyn ProgressObserver>>,
    segments: HashMap<u64, SegmentProgress>,
    segment_order: Vec<u64>,
    start_time: Instant,
    peak_bps: f64,
    last_emitted: Option<Instant>,
    total_segments: usize,
}

impl ProgressAggregator {
    pub fn new(total_segments: usize) -> Self {
        Self {
            observers: Vec::new(),
            segments: HashMap::new(),
            segment_order: Vec::new(),
            start_time: Instant::now(),
            peak_bps: 0.0,
            last_emitted: None,
            total_segments,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Consume progress messages until the channel closes or an error
    /// arrives. `completions` marks a segment index as fully done so
    /// `on_complete` fires exactly when every segment is complete.
    pub async fn run(
        mut self,
        mut progress_rx: mpsc::Receiver<Result<ProgressEvent, String>>,
        mut completion_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                msg = progress_rx.recv() => {
                    match msg {
                        Some(Ok(ev)) => {
                            if let Some(snapshot) = self.handle_event(ev) {
                                for observer in &self.observers {
                                    observer.on_progress(&snapshot).await;
                                }
                            }
                        }
                        Some(Err(error)) => {
                            for observer in &self.observers {
                                observer.on_error(&error).await;
                            }
                            return;
                        }
                        None => break,
                    }
                }
                idx = completion_rx.recv() => {
                    match idx {
                        Some(idx) => self.mark_completed(idx),
                        None => continue,
                    }
                }
            }
        }
        self.finish().await;
    }

    fn mark_completed(&mut self, segment_index: u64) {
        if let Some(seg) = self.segments.get_mut(&segment_index) {
            seg.completed = true;
        }
    }

    /// Process one event; returns a fresh snapshot only if the 100ms
    /// display-rate limit allows emitting right now. Intermediate updates
    /// are coalesced, not buffered.
    fn handle_event(&mut self, ev: ProgressEvent) -> Option<ProgressSnapshot> {
        let now = Instant::now();

        if !self.segments.contains_key(&ev.segment_index) {
            self.segment_order.push(ev.segment_index);
            self.segments.insert(
                ev.segment_index,
                SegmentProgress {
                    segment_index: ev.segment_index,
                    bytes_downloaded: 0,
                    total_bytes: ev.total_bytes.unwrap_or(0),
                    speed: 0.0,
                    last_update: now,
                    completed: false,
                },
            );
        }

        {
            let seg = self.segments.get_mut(&ev.segment_index).unwrap();
            seg.bytes_downloaded += ev.bytes_delta;
            if seg.total_bytes == 0 {
                if let Some(tb) = ev.total_bytes {
                    seg.total_bytes = tb;
                }
            }
            let elapsed = now.duration_since(seg.last_update).as_secs_f64();
            if elapsed > 0.0 {
                let instant_speed = ev.bytes_delta as f64 / elapsed;
                seg.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * seg.speed;
                seg.last_update = now;
            }
        }

        let combined_speed: f64 = self.segments.values().map(|s| s.speed).sum();
        self.peak_bps = self.peak_bps.max(combined_speed);

        let should_emit = match self.last_emitted {
            None => true,
            Some(last) => now.duration_since(last) >= DISPLAY_INTERVAL,
        };
        if !should_emit {
            return None;
        }
        self.last_emitted = Some(now);
        Some(self.build_snapshot(false))
    }

    fn build_snapshot(&self, done: bool) -> ProgressSnapshot {
        let total_bytes: u64 = self.segments.values().map(|s| s.total_bytes).sum();
        let total_downloaded: u64 = self.segments.values().map(|s| s.bytes_downloaded).sum();
        let combined_speed: f64 = self.segments.values().map(|s| s.speed).sum();

        // ETA = sum of per-segment remaining/speed when any segment speed >
        // 0; otherwise unknown.
        let any_speed = self.segments.values().any(|s| s.speed > 0.0);
        let eta_secs = if any_speed {
            Some(
                self.segments
                    .values()
                    .map(|s| {
                        let remaining = s.total_bytes.saturating_sub(s.bytes_downloaded) as f64;
                        if s.speed > 0.0 {
                            remaining / s.speed
                        } else {
                            0.0
                        }
                    })
                    .sum(),
            )
        } else {
            None
        };

        let elapsed = self.start_time.elapsed().as_secs_f64();
        let avg_bps = if elapsed > 0.0 {
            total_downloaded as f64 / elapsed
        } else {
            0.0
        };

        let segments = self
            .segment_order
            .iter()
            .filter_map(|id| self.segments.get(id))
            .map(|s| {
                let remaining = s.total_bytes.saturating_sub(s.bytes_downloaded);
                let eta = if s.speed > 0.0 {
                    Some(remaining as f64 / s.speed)
                } else {
                    None
                };
                SegmentSnapshot {
                    segment_index: s.segment_index,
                    bytes_downloaded: s.bytes_downloaded,
                    total_bytes: s.total_bytes,
                    speed: s.speed,
                    eta_secs: eta,
                }
            })
            .collect();

        ProgressSnapshot {
            segments,
            total_bytes_downloaded: total_downloaded,
            total_bytes,
            instantaneous_bps: combined_speed,
            peak_bps: self.peak_bps,
            avg_bps,
            eta_secs,
            done,
        }
    }

    fn all_segments_complete(&self) -> bool {
        self.total_segments > 0
            && self.segments.len() >= self.total_segments
            && self.segments.values().all(|s| s.completed)
    }

    /// Finalize: build the final snapshot with `done` reflecting whether
    /// every segment actually completed, notify all observers exactly once.
    async fn finish(mut self) {
        let done = self.all_segments_complete();
        // Recompute peak once more in case the last batch of events never
        // crossed the display-rate threshold.
        let combined_speed: f64 = self.segments.values().map(|s| s.speed).sum();
        self.peak_bps = self.peak_bps.max(combined_speed);

        let snapshot = self.build_snapshot(done);
        for observer in &self.observers {
            observer.on_complete(&snapshot).await;
        }
    }
}
