//! Picks segment count and byte ranges given content length, requested
//! connections, and server hints. Generalizes the
//! `create_pieces` XDM-style halving into the full size-banded algorithm.

use crate::types::{SegmentRange, ServerCapabilities, ThroughputSample};

pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;
pub const MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

pub struct Segmenter;

impl Segmenter {
    /// Build the ordered, partitioning list of ranges for `content_length`
    /// bytes, given the caller's requested connection count and what the
    /// probe learned about the server.
    pub fn plan(
        content_length: Option<u64>,
        requested_connections: usize,
        caps: &ServerCapabilities,
        prior_samples: &[ThroughputSample],
    ) -> Vec<SegmentRange> {
        let content_length = match content_length {
            Some(len) => len,
            None => return vec![whole_file_range(0)],
        };

        if !caps.accepts_ranges {
            return vec![whole_file_range(content_length.max(1) - 1)];
        }

        if content_length == 0 {
            return vec![SegmentRange { index: 0, start: 0, end: 0 }];
        }

        let n = Self::effective_connections(content_length, requested_connections, caps, prior_samples);
        partition(content_length, n)
    }

    /// Clamp the requested connection count by file size
    /// band, by the segment-size target band, and by any known server
    /// ceiling.
    fn effective_connections(
        content_length: u64,
        requested: usize,
        caps: &ServerCapabilities,
        prior_samples: &[ThroughputSample],
    ) -> usize {
        let requested = requested.max(1);

        let size_band_ceiling = size_band_ceiling(content_length);
        let mut n = requested.min(size_band_ceiling);

        // Clamp so segment size stays within [MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE].
        let max_n_by_min_segment = (content_length / MIN_SEGMENT_SIZE).max(1) as usize;
        n = n.min(max_n_by_min_segment);
        let min_n_by_max_segment = content_length.div_ceil(MAX_SEGMENT_SIZE).max(1) as usize;
        n = n.max(min_n_by_max_segment.min(n.max(1)));
        // Re-apply the size band ceiling after the max-segment floor, since
        // floors/ceilings interact: never exceed what the file size allows.
        n = n.min(size_band_ceiling).min(max_n_by_min_segment).max(1);

        if let Some(hint) = caps.server_hint {
            n = n.min(hint.connection_ceiling());
        }

        if let Some(variance) = throughput_variance(prior_samples) {
            if variance > 0.5 {
                // High variance: prefer more, smaller uniform segments.
                n = (n * 2).min(size_band_ceiling).min(max_n_by_min_segment).max(1);
            } else if variance < 0.2 {
                // Low variance: prefer fewer, larger segments targeting
                // ~15s of transfer at the measured average rate.
                if let Some(avg) = average_rate(prior_samples) {
                    if avg > 0.0 {
                        let target_segment_bytes = (avg * 15.0) as u64;
                        let target_segment_bytes = target_segment_bytes.clamp(MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE);
                        let target_n = content_length.div_ceil(target_segment_bytes).max(1) as usize;
                        n = n.min(target_n).max(1);
                    }
                }
            }
        }

        n.max(1)
    }
}

fn whole_file_range(last_byte: u64) -> SegmentRange {
    SegmentRange { index: 0, start: 0, end: last_byte }
}

/// File-size → max connections band.
fn size_band_ceiling(content_length: u64) -> usize {
    if content_length < MIB {
        1
    } else if content_length < 10 * MIB {
        2
    } else if content_length < 100 * MIB {
        4
    } else if content_length < GIB {
        8
    } else {
        16
    }
}

/// Partition `[0, content_length)` into `n` ranges: base size
/// `content_length / n`, remainder distributed one-per-segment to the
/// first `remainder` segments.
fn partition(content_length: u64, n: usize) -> Vec<SegmentRange> {
    let n = n.max(1) as u64;
    let base = content_length / n;
    let remainder = content_length % n;

    let mut ranges = Vec::with_capacity(n as usize);
    let mut start = 0u64;
    for i in 0..n {
        let size = base + if i < remainder { 1 } else { 0 };
        if size == 0 {
            break;
        }
        let end = start + size - 1;
        ranges.push(SegmentRange { index: i, start, end });
        start = end + 1;
    }
    ranges
}

fn average_rate(samples: &[ThroughputSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(|s| s.bytes_per_sec).sum::<f64>() / samples.len() as f64)
}

/// Coefficient of variation (stddev / mean) of recent throughput samples.
fn throughput_variance(samples: &[ThroughputSample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let mean = average_rate(samples)?;
    if mean <= 0.0 {
        return None;
    }
    let variance = samples
        .iter()
        .map(|s| (s.bytes_per_sec - mean).powi(2))
        .sum::<f64>()
        / samples.len() as f64;
    Some(variance.sqrt() / mean)
}
