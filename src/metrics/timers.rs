//! Timer metrics for operation latencies.

use super::Tag;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Records operation durations in milliseconds.
///
/// Durations above the configured clamp are recorded at the clamp, keeping a
/// single pathological call from dominating the mean; the clamp comes from
/// the `max.read.duration.metric` / `max.write.duration.metric` properties.
#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    tags: Vec<Tag>,
    clamp_ms: u64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Timer {
    /// Create a new timer. A `clamp_ms` of 0 disables clamping.
    pub fn new(name: &'static str, tags: Vec<Tag>, clamp_ms: u64) -> Self {
        Self {
            name,
            tags,
            clamp_ms,
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }

    /// Get the timer name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the timer tags.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Record a duration.
    pub fn record(&self, duration: Duration) {
        let mut ms = duration.as_millis() as u64;
        if self.clamp_ms > 0 && ms > self.clamp_ms {
            ms = self.clamp_ms;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Number of recorded durations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded durations in milliseconds.
    pub fn total_ms(&self) -> u64 {
        self.total_ms.load(Ordering::Relaxed)
    }

    /// Largest recorded duration in milliseconds.
    pub fn max_ms(&self) -> u64 {
        self.max_ms.load(Ordering::Relaxed)
    }

    /// Mean recorded duration in milliseconds.
    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.total_ms() as f64 / count as f64
        }
    }
}
