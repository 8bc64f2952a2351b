//! Enforces a byte rate on one transfer (or segment) using a sliding
//! window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// A source of the *current* allowed rate, re-read every window boundary so
/// a bandwidth-token change takes effect promptly.
pub trait RateSource: Send + Sync {
    /// `0` means unlimited.
    fn current_max_bps(&self) -> u64;
}

/// A fixed rate that never changes — used when no broker token is bound.
pub struct FixedRate(pub u64);

impl RateSource for FixedRate {
    fn current_max_bps(&self) -> u64 {
        self.0
    }
}

struct WindowState {
    window_start: Instant,
    bytes_in_window: u64,
}

pub struct SpeedGate {
    window: Duration,
    burst_factor: f64,
    state: Mutex<WindowState>,
    /// Lifetime total, for reporting to the bandwidth broker.
    total_bytes: AtomicU64,
}

impl SpeedGate {
    pub fn new(window: Duration, burst_factor: f64) -> Self {
        Self {
            window,
            burst_factor,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                bytes_in_window: 0,
            }),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(1), 1.2)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Called after writing `bytes` — sleeps if the sliding window's burst
    /// budget has been exceeded for the rate `source` currently allows.
    pub async fn on_write(&self, bytes: u64, source: &dyn RateSource) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);

        let max_bps = source.current_max_bps();
        if max_bps == 0 {
            return;
        }

        let sleep_for = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.window_start);

            if elapsed >= self.window {
                state.window_start = now;
                state.bytes_in_window = bytes;
                return;
            }

            state.bytes_in_window += bytes;

            let burst_budget = (max_bps as f64 * self.burst_factor) as u64;
            if state.bytes_in_window > burst_budget {
                let needed_secs = state.bytes_in_window as f64 / max_bps as f64;
                let elapsed_secs = elapsed.as_secs_f64();
                let sleep_secs = (needed_secs - elapsed_secs).max(0.0);
                Some(Duration::from_secs_f64(sleep_secs))
            } else {
                None
            }
        };

        if let Some(d) = sleep_for {
            tokio::time::sleep(d).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_rate_never_sleeps() {
        let gate = SpeedGate::with_defaults();
        let start = Instant::now();
        gate.on_write(10 * 1024 * 1024, &FixedRate(0)).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(gate.total_bytes(), 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn exceeding_burst_budget_sleeps() {
        let gate = SpeedGate::new(Duration::from_millis(200), 1.0);
        let rate = FixedRate(1024); // 1 KiB/s
        let start = Instant::now();
        // Well above the 1 KiB/s*200ms window budget — should force a sleep.
        gate.on_write(4096, &rate).await;
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn window_reset_after_elapsed() {
        let gate = SpeedGate::new(Duration::from_millis(10), 1.2);
        gate.on_write(1_000_000, &FixedRate(1_000_000)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        gate.on_write(1, &FixedRate(1_000_000)).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
