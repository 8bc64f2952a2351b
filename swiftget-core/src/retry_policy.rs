//! Computes the next retry delay from an attempt number, error class, and
//! jitter mode. Exponential-with-jitter is the default; the other
//! backoff/jitter kinds exist so a caller can tune behavior per transfer.

use std::time::Duration;

use rand::Rng;

use crate::error_classifier::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Exponential { base: Duration, multiplier: f64, cap: Duration },
    Linear { increment: Duration, cap: Duration },
    Fibonacci { cap: Duration },
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    None,
    /// Uniform multiplier in `[low, high]`, default `[0.5, 1.5]`.
    Uniform { low: f64, high: f64 },
    Gaussian { sigma: f64 },
    /// Delay computed from (and feeding back into) the previous delay,
    /// AWS-style decorrelated jitter.
    Decorrelated,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Uniform { low: 0.5, high: 1.5 }
    }
}

/// Context multipliers combined multiplicatively on top of the base delay
/// variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayContext {
    pub poor_network: bool,
    pub large_file: bool,
    pub multi_connection: bool,
}

impl DelayContext {
    fn multiplier(self) -> f64 {
        let mut m = 1.0;
        if self.poor_network {
            m *= 2.0;
        }
        if self.large_file {
            m *= 1.5;
        }
        if self.multi_connection {
            m *= 0.9;
        }
        m
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub jitter: Jitter,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Total accumulated delay a transfer may spend retrying before it must
    /// abort (default 300s).
    pub total_delay_cap: Duration,
    /// Optional circuit breaker: after this many consecutive failures,
    /// `is_open` refuses further retries until `cooldown` elapses.
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_cooldown: Duration,
}

impl RetryPolicy {
    /// The policy implied by an error class's retry defaults, wrapped with
    /// the backoff defaults for everything else.
    pub fn for_class(class: ErrorClass) -> Self {
        let policy = class.default_policy();
        Self {
            backoff: Backoff::Exponential {
                base: policy.base_delay,
                multiplier: 2.0,
                cap: Duration::from_secs(60),
            },
            jitter: Jitter::default(),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            total_delay_cap: Duration::from_secs(300),
            circuit_breaker_threshold: None,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }

    /// Compute the next delay for `attempt` (1-based), honoring an explicit
    /// `retry_after` override (e.g. from a 429/503 response) when present.
    pub fn next_delay(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        prev_delay: Option<Duration>,
        ctx: DelayContext,
    ) -> Duration {
        if let Some(ra) = retry_after {
            return ra.max(self.min_delay).min(self.max_delay);
        }

        let base = self.backoff_delay(attempt, prev_delay);
        let jittered = self.apply_jitter(base, prev_delay);
        let scaled = jittered.mul_f64(ctx.multiplier());
        scaled.max(self.min_delay).min(self.max_delay)
    }

    fn backoff_delay(&self, attempt: u32, _prev_delay: Option<Duration>) -> Duration {
        match self.backoff {
            Backoff::Exponential { base, multiplier, cap } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                base.mul_f64(factor).min(cap)
            }
            Backoff::Linear { increment, cap } => (increment * attempt).min(cap),
            Backoff::Fibonacci { cap } => fibonacci(attempt).min(cap),
            Backoff::Fixed(d) => d,
        }
    }

    fn apply_jitter(&self, base: Duration, prev_delay: Option<Duration>) -> Duration {
        let mut rng = rand::thread_rng();
        match self.jitter {
            Jitter::None => base,
            Jitter::Uniform { low, high } => {
                let factor: f64 = rng.gen_range(low..=high);
                base.mul_f64(factor)
            }
            Jitter::Gaussian { sigma } => {
                // Box-Muller, clamped to stay non-negative.
                let u1: f64 = rng.gen_range(1e-9..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                let factor = (1.0 + z * sigma).max(0.0);
                base.mul_f64(factor)
            }
            Jitter::Decorrelated => {
                let prev = prev_delay.unwrap_or(base);
                let upper = (prev * 3).max(base);
                let millis = rng.gen_range(base.as_millis().max(1)..=upper.as_millis().max(base.as_millis() + 1));
                Duration::from_millis(millis as u64)
            }
        }
    }

    /// Whether the circuit breaker is open given `consecutive_failures` and
    /// time since the last failure.
    pub fn circuit_open(&self, consecutive_failures: u32, elapsed_since_last_failure: Duration) -> bool {
        match self.circuit_breaker_threshold {
            Some(threshold) if consecutive_failures >= threshold => {
                elapsed_since_last_failure < self.circuit_breaker_cooldown
            }
            _ => false,
        }
    }
}

fn fibonacci(n: u32) -> Duration {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    Duration::from_secs(a)
}
