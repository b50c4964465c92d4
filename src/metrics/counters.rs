//! Counter metrics for monotonically increasing values.

use super::Tag;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter with a fixed tag set.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    tags: Vec<Tag>,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub fn new(name: &'static str, tags: Vec<Tag>) -> Self {
        Self {
            name,
            tags,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter tags.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Increment the counter by 1.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn increment_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new(
            "fast.fail",
            vec![("failure.reason", "NULL_CLIENT".to_string())],
        );

        assert_eq!(counter.get(), 0);

        counter.increment();
        assert_eq!(counter.get(), 1);

        counter.increment_by(5);
        assert_eq!(counter.get(), 6);
        assert_eq!(counter.name(), "fast.fail");
        assert_eq!(counter.tags().len(), 1);
    }
}
