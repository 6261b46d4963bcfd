//! Per-request latency collection.
//!
//! A preallocated array of microsecond samples appended through an atomic
//! index. Capacity is fixed at startup; samples past capacity are counted
//! but dropped, with a single warning when the requested run would exceed
//! the tracking limit.

use log::warn;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::Config;
use crate::{Error, Result};

/// Sizing assumption for timed runs: requests per second a run can retire.
pub const MAX_REQUESTS_PER_SECOND: u64 = 2_000_000;

/// Fixed-capacity, append-only latency sample array.
pub struct LatencyCollector {
    values: Box<[AtomicU32]>,
    next_index: AtomicU64,
    stored: AtomicU64,
}

impl LatencyCollector {
    /// Builds a collector with capacity derived from the run plan: zero
    /// when latency tracking is off, run-time based for timed/repeat runs,
    /// otherwise one slot per configured stream.
    pub fn for_config(config: &Config) -> Self {
        Self::with_capacity(max_latency_index(config))
    }

    /// Builds a collector holding at most `capacity` samples, zero-filled.
    pub fn with_capacity(capacity: u64) -> Self {
        let values = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            values,
            next_index: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.values.len() as u64
    }

    /// Appends one sample. Over-capacity samples bump the attempt counter
    /// and are otherwise dropped.
    pub fn record(&self, latency_us: u64) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        if index < self.capacity() {
            let clamped = latency_us.min(u32::MAX as u64) as u32;
            self.values[index as usize].store(clamped, Ordering::Relaxed);
            self.stored.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of samples actually stored.
    pub fn len(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples submitted, including dropped ones.
    pub fn attempted(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }

    /// Stored samples in storage order.
    pub fn snapshot(&self) -> Vec<u32> {
        let len = self.len().min(self.capacity()) as usize;
        self.values[..len]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect()
    }

    /// Encodes the extra-data blob:
    /// `[run_time: u32 LE][count: u64 LE][latency_us: u32 LE] * count`.
    pub fn extra_data(&self, run_time: u32) -> Vec<u8> {
        let samples = self.snapshot();
        let mut blob = Vec::with_capacity(4 + 8 + samples.len() * 4);
        blob.extend_from_slice(&run_time.to_le_bytes());
        blob.extend_from_slice(&(samples.len() as u64).to_le_bytes());
        for sample in samples {
            blob.extend_from_slice(&sample.to_le_bytes());
        }
        blob
    }
}

/// Decodes an extra-data blob back into `(run_time, samples)`.
pub fn decode_extra_data(blob: &[u8]) -> Result<(u32, Vec<u32>)> {
    let truncated = || Error::Config("extra data blob truncated".to_string());
    if blob.len() < 12 {
        return Err(truncated());
    }
    let run_time = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let count = u64::from_le_bytes([
        blob[4], blob[5], blob[6], blob[7], blob[8], blob[9], blob[10], blob[11],
    ]);
    let body = &blob[12..];
    if (body.len() as u64) < count.saturating_mul(4) {
        return Err(truncated());
    }
    let samples = body[..count as usize * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((run_time, samples))
}

/// Latency buffer capacity for a run plan.
fn max_latency_index(config: &Config) -> u64 {
    if !config.print_latency {
        return 0;
    }
    if config.run_time > 0 {
        let mut max = (config.run_time as u64 / 1000) * MAX_REQUESTS_PER_SECOND;
        let cap = (u32::MAX / 4) as u64;
        if max > cap {
            max = cap;
            warn!("limiting request latency tracking to {max} requests");
        }
        max
    } else {
        config.connection_count as u64 * config.stream_count as u64
    }
}
