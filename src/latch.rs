//! Write-completion latches and fan-out success policies.
//!
//! Every fan-out write hands its caller a [`WriteLatch`]. Replica tasks
//! report into it as they finish; the caller can await the policy-derived
//! success count with a timeout, or ignore it entirely for fire-and-forget
//! writes. When events run in latch mode, the latch terminates the event
//! once the quorum is met or a scheduled deadline fires, whichever comes
//! first.

use crate::event::{CacheEvent, EventDispatcher};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// How many replicas must acknowledge a fan-out write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// No acknowledgement required.
    None,
    /// A single replica suffices.
    One,
    /// A majority; with two or fewer replicas, all of them.
    Quorum,
    /// All but one replica; with two or fewer, one.
    AllMinusOne,
    /// Every replica.
    All,
}

impl Policy {
    /// Required success count for `total` counted replicas.
    pub fn required(&self, total: usize) -> usize {
        match self {
            Policy::None => 0,
            Policy::One => 1,
            Policy::Quorum => {
                if total == 0 {
                    0
                } else if total <= 2 {
                    total
                } else {
                    total / 2 + 1
                }
            }
            Policy::AllMinusOne => {
                if total == 0 {
                    0
                } else if total <= 2 {
                    1
                } else {
                    total - 1
                }
            }
            Policy::All => total,
        }
    }
}

/// Completion coordinator for one fan-out write.
#[derive(Debug)]
pub struct WriteLatch {
    policy: Policy,
    total: usize,
    required: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    notify: Notify,
    event: Mutex<Option<(Arc<CacheEvent>, EventDispatcher)>>,
}

impl WriteLatch {
    /// Create a latch over `total` counted replicas.
    pub fn new(policy: Policy, total: usize) -> Arc<Self> {
        Arc::new(Self {
            policy,
            total,
            required: policy.required(total),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            notify: Notify::new(),
            event: Mutex::new(None),
        })
    }

    /// A zero-width latch returned on fast failures. Nothing will ever
    /// complete it.
    pub fn zero(policy: Policy) -> Arc<Self> {
        Self::new(policy, 0)
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Counted replicas participating in this write.
    pub fn total_replicas(&self) -> usize {
        self.total
    }

    /// Successes required by the policy.
    pub fn required_successes(&self) -> usize {
        self.required
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether every counted replica has reported.
    pub fn is_done(&self) -> bool {
        self.success_count() + self.failure_count() >= self.total
    }

    /// Whether the policy's success count has been met.
    pub fn quorum_met(&self) -> bool {
        self.success_count() >= self.required
    }

    /// Record one replica's outcome. Invoked by fan-out tasks.
    pub fn complete(&self, success: bool) {
        if success {
            let count = self.succeeded.fetch_add(1, Ordering::AcqRel) + 1;
            if count == self.required {
                self.finish_event();
            }
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.notify.notify_waiters();
    }

    /// Wait until the policy is met, every replica has reported, or the
    /// timeout elapses. Returns whether the policy was met.
    pub async fn await_policy(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.quorum_met() {
                return true;
            }
            if self.is_done() {
                return self.quorum_met();
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.quorum_met(),
            }
        }
    }

    /// Wait until every counted replica has reported or the timeout elapses.
    /// Returns `(successes, failures)` at that point.
    pub async fn await_all(&self, timeout: Duration) -> (usize, usize) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        (self.success_count(), self.failure_count())
    }

    /// Attach an event for deferred termination in latch mode.
    pub(crate) fn attach_event(&self, event: Arc<CacheEvent>, dispatcher: EventDispatcher) {
        *self.event.lock() = Some((event, dispatcher));
    }

    /// Terminate the attached event after `delay` if the quorum never met it
    /// first.
    pub(crate) fn schedule_validation(self: &Arc<Self>, delay: Duration) {
        let latch = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if latch.event.lock().is_some() {
                debug!(
                    succeeded = latch.success_count(),
                    required = latch.required_successes(),
                    "latch validation deadline fired"
                );
            }
            latch.finish_event();
        });
    }

    fn finish_event(&self) {
        if let Some((event, dispatcher)) = self.event.lock().take() {
            dispatcher.complete(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        // (policy, total) -> required, per the fan-out policy table.
        let cases = [
            (Policy::None, 0, 0),
            (Policy::None, 3, 0),
            (Policy::One, 0, 1),
            (Policy::One, 5, 1),
            (Policy::Quorum, 0, 0),
            (Policy::Quorum, 1, 1),
            (Policy::Quorum, 2, 2),
            (Policy::Quorum, 3, 2),
            (Policy::Quorum, 4, 3),
            (Policy::Quorum, 5, 3),
            (Policy::AllMinusOne, 0, 0),
            (Policy::AllMinusOne, 1, 1),
            (Policy::AllMinusOne, 2, 1),
            (Policy::AllMinusOne, 3, 2),
            (Policy::AllMinusOne, 5, 4),
            (Policy::All, 0, 0),
            (Policy::All, 4, 4),
        ];
        for (policy, total, expected) in cases {
            assert_eq!(
                policy.required(total),
                expected,
                "{policy:?} over {total} replicas"
            );
        }
    }

    #[tokio::test]
    async fn test_await_policy_met() {
        let latch = WriteLatch::new(Policy::Quorum, 3);
        assert_eq!(latch.required_successes(), 2);

        latch.complete(true);
        assert!(!latch.quorum_met());

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.await_policy(Duration::from_secs(1)).await })
        };
        latch.complete(true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_policy_all_reported_without_quorum() {
        let latch = WriteLatch::new(Policy::All, 2);
        latch.complete(true);
        latch.complete(false);

        assert!(!latch.await_policy(Duration::from_millis(50)).await);
        assert_eq!(latch.success_count(), 1);
        assert_eq!(latch.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_policy_times_out() {
        let latch = WriteLatch::new(Policy::One, 3);
        assert!(!latch.await_policy(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_await_all() {
        let latch = WriteLatch::new(Policy::None, 2);
        latch.complete(true);
        latch.complete(true);

        let (ok, failed) = latch.await_all(Duration::from_millis(100)).await;
        assert_eq!((ok, failed), (2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_width_latch() {
        let latch = WriteLatch::zero(Policy::Quorum);
        assert_eq!(latch.total_replicas(), 0);
        assert_eq!(latch.required_successes(), 0);
        // Nothing to wait for.
        assert!(latch.await_policy(Duration::from_millis(10)).await);
    }
}
