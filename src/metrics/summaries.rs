//! Distribution summaries for non-latency values (TTLs, bulk key counts).

use super::Tag;
use std::sync::atomic::{AtomicU64, Ordering};

/// Records a distribution of integer values.
#[derive(Debug)]
pub struct DistributionSummary {
    name: &'static str,
    tags: Vec<Tag>,
    count: AtomicU64,
    total: AtomicU64,
    max: AtomicU64,
}

impl DistributionSummary {
    /// Create a new distribution summary.
    pub fn new(name: &'static str, tags: Vec<Tag>) -> Self {
        Self {
            name,
            tags,
            count: AtomicU64::new(0),
            total: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Get the summary name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the summary tags.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Record a value.
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded values.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Largest recorded value.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_records() {
        let summary = DistributionSummary::new("ttl", Vec::new());

        summary.record(900);
        summary.record(60);

        assert_eq!(summary.count(), 2);
        assert_eq!(summary.total(), 960);
        assert_eq!(summary.max(), 900);
    }
}
