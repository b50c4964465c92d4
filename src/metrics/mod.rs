//! Metrics for monitoring and observability.
//!
//! Every call records into a small taxonomy: an overall-call timer tagged
//! with the operation, result, hit/miss and attempt; fast-fail and
//! internal-failure counters; and distribution summaries for TTLs and bulk
//! key counts. Handles are cached in concurrent maps keyed by their
//! disambiguators, so the hot path is a single map lookup plus an atomic add.

mod counters;
mod summaries;
mod timers;

pub use counters::Counter;
pub use summaries::DistributionSummary;
pub use timers::Timer;

use crate::event::Call;
use crate::pool::ServerGroup;
use dashmap::DashMap;
use std::sync::Arc;

/// A metric tag: name plus value.
pub type Tag = (&'static str, String);

/// Timer covering every complete call.
pub const OVERALL_CALL: &str = "overall.call";
/// Distribution of requested key counts on bulk reads.
pub const OVERALL_KEYS_SIZE: &str = "overall.keys.size";
/// Calls rejected before any backend work.
pub const FAST_FAIL: &str = "fast.fail";
/// Core faults such as hash collisions.
pub const INTERNAL_FAIL: &str = "internal.fail";
/// Listener failures, tagged with stage and listener name.
pub const INTERNAL_EVENT_FAIL: &str = "internal.event.fail";
/// Distribution of TTLs on writes.
pub const TTL: &str = "ttl";

pub const TAG_CALL: &str = "call";
pub const TAG_CALL_TYPE: &str = "call.type";
pub const TAG_IPC_RESULT: &str = "ipc.result";
pub const TAG_CACHE_HIT: &str = "cache.hit";
pub const TAG_ATTEMPT: &str = "attempt";
pub const TAG_SERVER_GROUP: &str = "server.group";
pub const TAG_ZONE: &str = "zone";
pub const TAG_FAILURE_REASON: &str = "failure.reason";
pub const TAG_EVENT_STAGE: &str = "event.stage";
pub const TAG_EVENT_LISTENER: &str = "event.listener";
pub const TAG_APP: &str = "app";
pub const TAG_PREFIX: &str = "prefix";

pub const RESULT_SUCCESS: &str = "SUCCESS";
pub const RESULT_ERROR: &str = "ERROR";
pub const RESULT_TIMEOUT: &str = "TIMEOUT";
pub const RESULT_THROTTLED: &str = "THROTTLED";

pub const HIT_YES: &str = "YES";
pub const HIT_NO: &str = "NO";
pub const HIT_PARTIAL: &str = "PARTIAL";

pub const ATTEMPT_INITIAL: &str = "INITIAL";
pub const ATTEMPT_SECOND: &str = "SECOND";
pub const ATTEMPT_THIRD_UP: &str = "THIRD_UP";

pub const REASON_NULL_CLIENT: &str = "NULL_CLIENT";
pub const REASON_THROTTLED: &str = "THROTTLED";
pub const REASON_INVALID_TTL: &str = "INVALID_TTL";
pub const REASON_KEY_HASH_COLLISION: &str = "KEY_HASH_COLLISION";

/// Map an attempt number to its metric bucket.
pub fn attempt_bucket(tries: usize) -> &'static str {
    match tries {
        0 | 1 => ATTEMPT_INITIAL,
        2 => ATTEMPT_SECOND,
        _ => ATTEMPT_THIRD_UP,
    }
}

/// Per-client metric registry with tag-keyed handle caches.
#[derive(Debug)]
pub struct ClientMetrics {
    base_tags: Vec<Tag>,
    timers: DashMap<String, Arc<Timer>>,
    counters: DashMap<String, Arc<Counter>>,
    summaries: DashMap<String, Arc<DistributionSummary>>,
}

impl ClientMetrics {
    /// Create a registry tagged with the application name and prefix.
    pub fn new(app_name: &str, prefix: Option<&str>) -> Self {
        let mut base_tags = vec![(TAG_APP, app_name.to_string())];
        if let Some(p) = prefix {
            base_tags.push((TAG_PREFIX, p.to_string()));
        }
        Self {
            base_tags,
            timers: DashMap::new(),
            counters: DashMap::new(),
            summaries: DashMap::new(),
        }
    }

    /// Overall-call timer for one (operation, hit, result, attempt, group)
    /// combination. The handle is created once and cached.
    pub fn operation_timer(
        &self,
        call: Call,
        hit: Option<&'static str>,
        result: &'static str,
        tries: usize,
        group: Option<&ServerGroup>,
        clamp_ms: u64,
    ) -> Arc<Timer> {
        let attempt = attempt_bucket(tries);
        let mut key = String::with_capacity(48);
        key.push_str(call.name());
        if let Some(h) = hit {
            key.push_str(h);
        }
        key.push_str(result);
        key.push_str(attempt);
        if let Some(g) = group {
            key.push_str(&g.name);
        }

        if let Some(timer) = self.timers.get(&key) {
            return Arc::clone(timer.value());
        }

        let mut tags = self.base_tags.clone();
        tags.push((TAG_CALL, call.name().to_string()));
        tags.push((TAG_CALL_TYPE, call.call_type().as_str().to_string()));
        tags.push((TAG_IPC_RESULT, result.to_string()));
        if let Some(h) = hit {
            tags.push((TAG_CACHE_HIT, h.to_string()));
        }
        tags.push((TAG_ATTEMPT, attempt.to_string()));
        if let Some(g) = group {
            tags.push((TAG_SERVER_GROUP, g.name.clone()));
            tags.push((TAG_ZONE, g.zone.clone()));
        }

        let timer = Arc::new(Timer::new(OVERALL_CALL, tags, clamp_ms));
        self.timers.entry(key).or_insert(timer).value().clone()
    }

    /// Count a call that failed before reaching any backend.
    pub fn fast_fail(&self, reason: &'static str, call: Call) {
        self.counter(FAST_FAIL, call, TAG_FAILURE_REASON, reason, None)
            .increment();
    }

    /// Current fast-fail count for one (reason, call) pair.
    pub fn fast_fail_count(&self, reason: &'static str, call: Call) -> u64 {
        self.counter(FAST_FAIL, call, TAG_FAILURE_REASON, reason, None)
            .get()
    }

    /// Count a core fault such as a hash collision.
    pub fn internal_fail(&self, reason: &'static str, call: Call) {
        self.counter(INTERNAL_FAIL, call, TAG_FAILURE_REASON, reason, None)
            .increment();
    }

    /// Current internal-failure count for one (reason, call) pair.
    pub fn internal_fail_count(&self, reason: &'static str, call: Call) -> u64 {
        self.counter(INTERNAL_FAIL, call, TAG_FAILURE_REASON, reason, None)
            .get()
    }

    /// Count a listener failure at the given stage.
    pub fn event_fail(&self, stage: &'static str, call: Call, listener: &str) {
        self.counter(INTERNAL_EVENT_FAIL, call, TAG_EVENT_STAGE, stage, Some(listener))
            .increment();
    }

    /// Current listener-failure count for one (stage, call, listener) triple.
    pub fn event_fail_count(&self, stage: &'static str, call: Call, listener: &str) -> u64 {
        self.counter(INTERNAL_EVENT_FAIL, call, TAG_EVENT_STAGE, stage, Some(listener))
            .get()
    }

    /// TTL distribution for one write operation.
    pub fn ttl_summary(&self, call: Call) -> Arc<DistributionSummary> {
        let key = format!("ttl:{}", call.name());
        if let Some(summary) = self.summaries.get(&key) {
            return Arc::clone(summary.value());
        }
        let mut tags = self.base_tags.clone();
        tags.push((TAG_CALL, call.name().to_string()));
        tags.push((TAG_CALL_TYPE, call.call_type().as_str().to_string()));
        let summary = Arc::new(DistributionSummary::new(TTL, tags));
        self.summaries.entry(key).or_insert(summary).value().clone()
    }

    /// Requested-key-count distribution for bulk reads.
    pub fn bulk_keys_summary(&self) -> Arc<DistributionSummary> {
        let key = "bulk.keys".to_string();
        if let Some(summary) = self.summaries.get(&key) {
            return Arc::clone(summary.value());
        }
        let mut tags = self.base_tags.clone();
        tags.push((TAG_CALL, Call::Bulk.name().to_string()));
        tags.push((TAG_CALL_TYPE, "READ".to_string()));
        let summary = Arc::new(DistributionSummary::new(OVERALL_KEYS_SIZE, tags));
        self.summaries.entry(key).or_insert(summary).value().clone()
    }

    fn counter(
        &self,
        name: &'static str,
        call: Call,
        reason_tag: &'static str,
        reason: &'static str,
        listener: Option<&str>,
    ) -> Arc<Counter> {
        let mut key = String::with_capacity(48);
        key.push_str(name);
        key.push(':');
        key.push_str(reason);
        key.push_str(call.name());
        if let Some(l) = listener {
            key.push_str(l);
        }

        if let Some(counter) = self.counters.get(&key) {
            return Arc::clone(counter.value());
        }

        let mut tags = self.base_tags.clone();
        tags.push((TAG_CALL, call.name().to_string()));
        tags.push((TAG_CALL_TYPE, call.call_type().as_str().to_string()));
        tags.push((reason_tag, reason.to_string()));
        if let Some(l) = listener {
            tags.push((TAG_EVENT_LISTENER, l.to_string()));
        }

        let counter = Arc::new(Counter::new(name, tags));
        self.counters.entry(key).or_insert(counter).value().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_attempt_buckets() {
        assert_eq!(attempt_bucket(0), ATTEMPT_INITIAL);
        assert_eq!(attempt_bucket(1), ATTEMPT_INITIAL);
        assert_eq!(attempt_bucket(2), ATTEMPT_SECOND);
        assert_eq!(attempt_bucket(3), ATTEMPT_THIRD_UP);
        assert_eq!(attempt_bucket(7), ATTEMPT_THIRD_UP);
    }

    #[test]
    fn test_operation_timer_cached_per_disambiguators() {
        let metrics = ClientMetrics::new("movies", Some("cid"));
        let group = ServerGroup::new("movies-a", "us-east-1a");

        let t1 = metrics.operation_timer(Call::Get, Some(HIT_YES), RESULT_SUCCESS, 1, Some(&group), 0);
        let t2 = metrics.operation_timer(Call::Get, Some(HIT_YES), RESULT_SUCCESS, 1, Some(&group), 0);
        assert!(Arc::ptr_eq(&t1, &t2));

        let t3 = metrics.operation_timer(Call::Get, Some(HIT_NO), RESULT_SUCCESS, 2, Some(&group), 0);
        assert!(!Arc::ptr_eq(&t1, &t3));

        t1.record(Duration::from_millis(5));
        assert_eq!(t2.count(), 1);
        assert_eq!(t3.count(), 0);
    }

    #[test]
    fn test_timer_tags_carry_taxonomy() {
        let metrics = ClientMetrics::new("movies", None);
        let group = ServerGroup::new("movies-b", "us-east-1b");
        let timer = metrics.operation_timer(Call::Get, Some(HIT_NO), RESULT_SUCCESS, 2, Some(&group), 0);

        let tags: std::collections::HashMap<_, _> =
            timer.tags().iter().cloned().collect();
        assert_eq!(tags[TAG_CALL], "GET");
        assert_eq!(tags[TAG_CALL_TYPE], "READ");
        assert_eq!(tags[TAG_CACHE_HIT], "NO");
        assert_eq!(tags[TAG_ATTEMPT], "SECOND");
        assert_eq!(tags[TAG_SERVER_GROUP], "movies-b");
        assert_eq!(tags[TAG_ZONE], "us-east-1b");
    }

    #[test]
    fn test_fast_fail_counts() {
        let metrics = ClientMetrics::new("movies", None);

        metrics.fast_fail(REASON_NULL_CLIENT, Call::Get);
        metrics.fast_fail(REASON_NULL_CLIENT, Call::Get);
        metrics.fast_fail(REASON_THROTTLED, Call::Set);

        assert_eq!(metrics.fast_fail_count(REASON_NULL_CLIENT, Call::Get), 2);
        assert_eq!(metrics.fast_fail_count(REASON_THROTTLED, Call::Set), 1);
        assert_eq!(metrics.fast_fail_count(REASON_INVALID_TTL, Call::Set), 0);
    }

    #[test]
    fn test_summaries() {
        let metrics = ClientMetrics::new("movies", None);

        metrics.ttl_summary(Call::Set).record(900);
        metrics.ttl_summary(Call::Set).record(60);
        metrics.bulk_keys_summary().record(3);

        assert_eq!(metrics.ttl_summary(Call::Set).count(), 2);
        assert_eq!(metrics.bulk_keys_summary().total(), 3);
    }
}
