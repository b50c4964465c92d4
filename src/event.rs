//! Per-call events and the listener plug-in surface.
//!
//! A [`CacheEvent`] is created for a call only when listeners are installed;
//! the fast path skips event bookkeeping entirely. Listener failures are
//! always swallowed and counted — a broken listener must never fail a cache
//! call.

use crate::error::Result;
use crate::key::CacheKey;
use crate::metrics::ClientMetrics;
use crate::value::CachedData;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// The logical cache operation a call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Get,
    GetAndTouch,
    GetAll,
    Bulk,
    BulkAndTouch,
    MetaGet,
    MetaDebug,
    Set,
    Add,
    Replace,
    Append,
    AppendOrAdd,
    Delete,
    Touch,
    Incr,
    Decr,
}

/// Whether a call reads or writes, for metric tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Read,
    Write,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Read => "READ",
            CallType::Write => "WRITE",
        }
    }
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Get => "GET",
            Call::GetAndTouch => "GET_AND_TOUCH",
            Call::GetAll => "GET_ALL",
            Call::Bulk => "BULK",
            Call::BulkAndTouch => "BULK_AND_TOUCH",
            Call::MetaGet => "META_GET",
            Call::MetaDebug => "META_DEBUG",
            Call::Set => "SET",
            Call::Add => "ADD",
            Call::Replace => "REPLACE",
            Call::Append => "APPEND",
            Call::AppendOrAdd => "APPEND_OR_ADD",
            Call::Delete => "DELETE",
            Call::Touch => "TOUCH",
            Call::Incr => "INCR",
            Call::Decr => "DECR",
        }
    }

    pub fn call_type(&self) -> CallType {
        match self {
            Call::Get
            | Call::GetAndTouch
            | Call::GetAll
            | Call::Bulk
            | Call::BulkAndTouch
            | Call::MetaGet
            | Call::MetaDebug => CallType::Read,
            _ => CallType::Write,
        }
    }
}

impl std::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-call event handed to listeners.
///
/// Mutated only by the orchestrator; listeners read it. Interior mutability
/// is required because fan-out writes share the event with their latch for
/// deferred termination.
#[derive(Debug)]
pub struct CacheEvent {
    call: Call,
    app_name: String,
    prefix: Option<String>,
    start_time_ms: u64,
    inner: RwLock<EventState>,
}

#[derive(Debug, Default)]
struct EventState {
    keys: Vec<CacheKey>,
    ttl: Option<u64>,
    payload: Option<CachedData>,
    end_time_ms: Option<u64>,
    status: Option<String>,
    attributes: HashMap<String, String>,
}

impl CacheEvent {
    pub(crate) fn new(call: Call, app_name: &str, prefix: Option<&str>) -> Self {
        Self {
            call,
            app_name: app_name.to_string(),
            prefix: prefix.map(|p| p.to_string()),
            start_time_ms: wall_clock_ms(),
            inner: RwLock::new(EventState::default()),
        }
    }

    pub fn call(&self) -> Call {
        self.call
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> Option<u64> {
        self.inner.read().end_time_ms
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.read().keys.clone()
    }

    pub fn ttl(&self) -> Option<u64> {
        self.inner.read().ttl
    }

    pub fn payload(&self) -> Option<CachedData> {
        self.inner.read().payload.clone()
    }

    pub fn status(&self) -> Option<String> {
        self.inner.read().status.clone()
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.inner.read().attributes.get(name).cloned()
    }

    pub(crate) fn set_keys(&self, keys: Vec<CacheKey>) {
        self.inner.write().keys = keys;
    }

    pub(crate) fn set_ttl(&self, ttl: u64) {
        self.inner.write().ttl = Some(ttl);
    }

    pub(crate) fn set_payload(&self, payload: CachedData) {
        self.inner.write().payload = Some(payload);
    }

    pub(crate) fn set_status(&self, status: &str) {
        self.inner.write().status = Some(status.to_string());
    }

    pub(crate) fn set_attribute(&self, name: &str, value: impl Into<String>) {
        self.inner
            .write()
            .attributes
            .insert(name.to_string(), value.into());
    }

    fn mark_end(&self) {
        self.inner.write().end_time_ms = Some(wall_clock_ms());
    }
}

/// Lifecycle hooks invoked around every call when installed.
///
/// Implementations must be cheap and must not block; an `Err` from any hook
/// is swallowed and counted, never propagated to the caller.
pub trait EventListener: Send + Sync {
    /// Return `true` to reject the call before any backend work happens.
    fn on_throttle(&self, _event: &CacheEvent) -> Result<bool> {
        Ok(false)
    }

    fn on_start(&self, _event: &CacheEvent) -> Result<()> {
        Ok(())
    }

    fn on_complete(&self, _event: &CacheEvent) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _event: &CacheEvent, _error: &crate::error::Error) -> Result<()> {
        Ok(())
    }

    /// Name used in listener-failure metrics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Registry of installed listeners. The snapshot handed to dispatch is
/// immutable; registration after client construction affects later calls.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.read().clone()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Dispatches event stages to listeners, isolating and counting failures.
///
/// Shared between the client and write latches, which terminate events after
/// the call has already returned.
#[derive(Debug, Clone)]
pub(crate) struct EventDispatcher {
    bus: Arc<EventBus>,
    metrics: Arc<ClientMetrics>,
}

impl EventDispatcher {
    pub(crate) fn new(bus: Arc<EventBus>, metrics: Arc<ClientMetrics>) -> Self {
        Self { bus, metrics }
    }

    /// Create an event only when listeners are installed.
    pub(crate) fn create(
        &self,
        call: Call,
        app_name: &str,
        prefix: Option<&str>,
    ) -> Option<Arc<CacheEvent>> {
        if self.bus.is_empty() {
            return None;
        }
        Some(Arc::new(CacheEvent::new(call, app_name, prefix)))
    }

    /// Run the throttle stage. Short-circuits on the first listener that
    /// rejects; listener failures never reject.
    pub(crate) fn throttle(&self, event: &CacheEvent) -> bool {
        for listener in self.bus.snapshot() {
            match listener.on_throttle(event) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    self.metrics.event_fail("throttle", event.call(), listener.name());
                    debug!(listener = listener.name(), error = %e, "throttle listener failed");
                }
            }
        }
        false
    }

    pub(crate) fn start(&self, event: &CacheEvent) {
        for listener in self.bus.snapshot() {
            if let Err(e) = listener.on_start(event) {
                self.metrics.event_fail("start", event.call(), listener.name());
                debug!(listener = listener.name(), error = %e, "start listener failed");
            }
        }
    }

    pub(crate) fn complete(&self, event: &CacheEvent) {
        event.mark_end();
        for listener in self.bus.snapshot() {
            if let Err(e) = listener.on_complete(event) {
                self.metrics.event_fail("end", event.call(), listener.name());
                debug!(listener = listener.name(), error = %e, "complete listener failed");
            }
        }
    }

    pub(crate) fn error(&self, event: &CacheEvent, error: &crate::error::Error) {
        event.mark_end();
        for listener in self.bus.snapshot() {
            if let Err(e) = listener.on_error(event, error) {
                self.metrics.event_fail("error", event.call(), listener.name());
                debug!(listener = listener.name(), error = %e, "error listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        starts: AtomicUsize,
        completes: AtomicUsize,
    }

    impl EventListener for Counting {
        fn on_start(&self, _event: &CacheEvent) -> Result<()> {
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn on_complete(&self, _event: &CacheEvent) -> Result<()> {
            self.completes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Broken;

    impl EventListener for Broken {
        fn on_start(&self, _event: &CacheEvent) -> Result<()> {
            Err(Error::Unexpected("listener bug".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    struct Rejecting;

    impl EventListener for Rejecting {
        fn on_throttle(&self, _event: &CacheEvent) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    fn dispatcher(bus: Arc<EventBus>) -> EventDispatcher {
        EventDispatcher::new(bus, Arc::new(ClientMetrics::new("movies", None)))
    }

    #[test]
    fn test_no_listeners_no_event() {
        let d = dispatcher(EventBus::new());
        assert!(d.create(Call::Get, "movies", None).is_none());
    }

    #[test]
    fn test_listeners_receive_stages() {
        let bus = EventBus::new();
        let listener = Arc::new(Counting {
            starts: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
        });
        bus.register(listener.clone());

        let d = dispatcher(bus);
        let event = d.create(Call::Get, "movies", None).unwrap();
        d.start(&event);
        d.complete(&event);

        assert_eq!(listener.starts.load(Ordering::Relaxed), 1);
        assert_eq!(listener.completes.load(Ordering::Relaxed), 1);
        assert!(event.end_time_ms().is_some());
    }

    #[test]
    fn test_broken_listener_is_isolated() {
        let bus = EventBus::new();
        bus.register(Arc::new(Broken));
        let counting = Arc::new(Counting {
            starts: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
        });
        bus.register(counting.clone());

        let metrics = Arc::new(ClientMetrics::new("movies", None));
        let d = EventDispatcher::new(bus, metrics.clone());
        let event = d.create(Call::Set, "movies", None).unwrap();
        d.start(&event);

        // The healthy listener still ran and the failure was counted.
        assert_eq!(counting.starts.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.event_fail_count("start", Call::Set, "broken"), 1);
    }

    #[test]
    fn test_throttle_short_circuits() {
        let bus = EventBus::new();
        bus.register(Arc::new(Rejecting));

        let d = dispatcher(bus);
        let event = d.create(Call::Get, "movies", None).unwrap();
        assert!(d.throttle(&event));
    }

    #[test]
    fn test_event_attributes() {
        let event = CacheEvent::new(Call::Bulk, "movies", Some("cid"));
        event.set_attribute("status", "BHIT_PARTIAL");
        assert_eq!(event.attribute("status").as_deref(), Some("BHIT_PARTIAL"));
        assert_eq!(event.prefix(), Some("cid"));
        assert!(event.attribute("missing").is_none());
    }

    #[test]
    fn test_call_types() {
        assert_eq!(Call::Get.call_type(), CallType::Read);
        assert_eq!(Call::BulkAndTouch.call_type(), CallType::Read);
        assert_eq!(Call::Set.call_type(), CallType::Write);
        assert_eq!(Call::Incr.call_type(), CallType::Write);
    }
}
