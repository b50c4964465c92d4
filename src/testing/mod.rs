//! Testing utilities for the cache client.
//!
//! Provides in-memory implementations of the [`Replica`] and [`ReplicaPool`]
//! collaborator traits, recording event listeners and a small test-bed
//! builder. The mocks record every backend call so tests can assert on
//! attempt counts and fallback ordering, and can be told to fail in specific
//! ways to exercise the error surface.

#[cfg(test)]
mod read_tests;

use crate::client::CacheClient;
use crate::config::Properties;
use crate::error::{Error, Result};
use crate::event::{CacheEvent, EventBus, EventListener};
use crate::pool::{ItemMetadata, MetaItem, PoolManager, Replica, ReplicaPool, ServerGroup};
use crate::value::{CachedData, FLAG_UTF8};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a [`MockReplica`] should fail its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Connect,
    Timeout,
    ReadQueueFull,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    data: CachedData,
    ttl: u64,
}

/// In-memory replica backed by a concurrent map.
pub struct MockReplica {
    group: ServerGroup,
    duet: bool,
    store: DashMap<String, StoredEntry>,
    fail_mode: Mutex<Option<FailMode>>,
    fail_counter_ops: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockReplica {
    pub fn new(name: &str, zone: &str) -> Arc<Self> {
        Arc::new(Self {
            group: ServerGroup::new(name, zone),
            duet: false,
            store: DashMap::new(),
            fail_mode: Mutex::new(None),
            fail_counter_ops: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A replica that expects un-prefixed application keys on the wire.
    pub fn duet(name: &str, zone: &str) -> Arc<Self> {
        Arc::new(Self {
            group: ServerGroup::new(name, zone),
            duet: true,
            store: DashMap::new(),
            fail_mode: Mutex::new(None),
            fail_counter_ops: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Seed a UTF-8 value under the exact wire key.
    pub fn seed(&self, key: &str, value: &str) {
        self.seed_data(key, CachedData::new(FLAG_UTF8, Bytes::copy_from_slice(value.as_bytes())));
    }

    /// Seed a raw payload under the exact wire key.
    pub fn seed_data(&self, key: &str, data: CachedData) {
        self.store.insert(
            key.to_string(),
            StoredEntry { data, ttl: 0 },
        );
    }

    pub fn stored(&self, key: &str) -> Option<CachedData> {
        self.store.get(key).map(|e| e.data.clone())
    }

    pub fn stored_ttl(&self, key: &str) -> Option<u64> {
        self.store.get(key).map(|e| e.ttl)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    /// Make every subsequent operation fail with the given mode.
    pub fn fail_with(&self, mode: Option<FailMode>) {
        *self.fail_mode.lock() = mode;
    }

    /// Make incr/decr report that they could not apply the mutation.
    pub fn fail_counter_ops(&self, fail: bool) {
        self.fail_counter_ops.store(fail, Ordering::SeqCst);
    }

    /// Every recorded call as `"op key"` strings, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls for one operation.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    fn record(&self, op: &str, key: &str) {
        self.calls.lock().push(format!("{op} {key}"));
    }

    fn check_fail(&self) -> Result<()> {
        match *self.fail_mode.lock() {
            Some(FailMode::Connect) => Err(Error::Connect(format!("{} unreachable", self.group))),
            Some(FailMode::Timeout) => {
                Err(Error::Timeout(format!("{} deadline exceeded", self.group)))
            }
            Some(FailMode::ReadQueueFull) => {
                Err(Error::ReadQueueFull(format!("{} queue full", self.group)))
            }
            None => Ok(()),
        }
    }

    fn counter_value(&self, key: &str) -> Option<u64> {
        self.store
            .get(key)
            .and_then(|e| std::str::from_utf8(&e.data.data).ok()?.parse().ok())
    }

    fn store_counter(&self, key: &str, value: u64, ttl: u64) {
        self.store.insert(
            key.to_string(),
            StoredEntry {
                data: CachedData::new(0, Bytes::from(value.to_string())),
                ttl,
            },
        );
    }
}

#[async_trait]
impl Replica for MockReplica {
    fn server_group(&self) -> &ServerGroup {
        &self.group
    }

    fn is_duet(&self) -> bool {
        self.duet
    }

    async fn get(&self, key: &str) -> Result<Option<CachedData>> {
        self.record("get", key);
        self.check_fail()?;
        Ok(self.stored(key))
    }

    async fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CachedData>> {
        self.record("get_bulk", &keys.join(","));
        self.check_fail()?;
        Ok(keys
            .iter()
            .filter_map(|k| self.stored(k).map(|d| (k.clone(), d)))
            .collect())
    }

    async fn meta_get(&self, key: &str) -> Result<Option<MetaItem>> {
        self.record("meta_get", key);
        self.check_fail()?;
        Ok(self.store.get(key).map(|e| MetaItem {
            data: e.data.clone(),
            metadata: ItemMetadata {
                seconds_left_to_expire: Some(e.ttl),
                size_bytes: Some(e.data.data.len() as u64),
                fetched: true,
                ..ItemMetadata::default()
            },
        }))
    }

    async fn meta_debug(&self, key: &str) -> Result<Option<ItemMetadata>> {
        self.record("meta_debug", key);
        self.check_fail()?;
        Ok(self.store.get(key).map(|e| ItemMetadata {
            seconds_left_to_expire: Some(e.ttl),
            size_bytes: Some(e.data.data.len() as u64),
            ..ItemMetadata::default()
        }))
    }

    async fn set(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool> {
        self.record("set", key);
        self.check_fail()?;
        self.store.insert(
            key.to_string(),
            StoredEntry {
                data: value.clone(),
                ttl,
            },
        );
        Ok(true)
    }

    async fn add(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool> {
        self.record("add", key);
        self.check_fail()?;
        if self.store.contains_key(key) {
            return Ok(false);
        }
        self.store.insert(
            key.to_string(),
            StoredEntry {
                data: value.clone(),
                ttl,
            },
        );
        Ok(true)
    }

    async fn replace(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool> {
        self.record("replace", key);
        self.check_fail()?;
        if !self.store.contains_key(key) {
            return Ok(false);
        }
        self.store.insert(
            key.to_string(),
            StoredEntry {
                data: value.clone(),
                ttl,
            },
        );
        Ok(true)
    }

    async fn append(&self, key: &str, value: &CachedData) -> Result<bool> {
        self.record("append", key);
        self.check_fail()?;
        match self.store.get_mut(key) {
            Some(mut entry) => {
                let mut bytes = entry.data.data.to_vec();
                bytes.extend_from_slice(&value.data);
                entry.data = CachedData::new(entry.data.flags, bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_or_add(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool> {
        self.record("append_or_add", key);
        self.check_fail()?;
        if self.store.contains_key(key) {
            self.append(key, value).await
        } else {
            self.store.insert(
                key.to_string(),
                StoredEntry {
                    data: value.clone(),
                    ttl,
                },
            );
            Ok(true)
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.record("delete", key);
        self.check_fail()?;
        Ok(self.store.remove(key).is_some())
    }

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        self.record("touch", key);
        self.check_fail()?;
        match self.store.get_mut(key) {
            Some(mut entry) => {
                entry.ttl = ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>> {
        self.record("incr", key);
        self.check_fail()?;
        if self.fail_counter_ops.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let next = match self.counter_value(key) {
            Some(current) => current.saturating_add(by),
            None => default,
        };
        self.store_counter(key, next, ttl);
        Ok(Some(next))
    }

    async fn decr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>> {
        self.record("decr", key);
        self.check_fail()?;
        if self.fail_counter_ops.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let next = match self.counter_value(key) {
            Some(current) => current.saturating_sub(by),
            None => default,
        };
        self.store_counter(key, next, ttl);
        Ok(Some(next))
    }
}

impl std::fmt::Debug for MockReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockReplica")
            .field("group", &self.group)
            .field("entries", &self.store.len())
            .finish()
    }
}

/// In-memory pool over a fixed set of mock replicas.
pub struct MockPool {
    replicas: Vec<Arc<MockReplica>>,
    primary: AtomicUsize,
    write_only: RwLock<Vec<usize>>,
    read_timeout: Duration,
    operation_timeout: Duration,
    fallback: AtomicBool,
}

impl MockPool {
    pub fn new(replicas: Vec<Arc<MockReplica>>) -> Arc<Self> {
        Arc::new(Self {
            replicas,
            primary: AtomicUsize::new(0),
            write_only: RwLock::new(Vec::new()),
            read_timeout: Duration::from_millis(100),
            operation_timeout: Duration::from_millis(500),
            fallback: AtomicBool::new(true),
        })
    }

    /// Choose which replica serves primary reads.
    pub fn set_primary(&self, index: usize) {
        self.primary.store(index, Ordering::SeqCst);
    }

    /// Mark a replica as write-only: it receives fan-out writes but serves
    /// no reads and does not count toward write quorums.
    pub fn mark_write_only(&self, index: usize) {
        self.write_only.write().push(index);
    }

    pub fn set_supports_fallback(&self, supported: bool) {
        self.fallback.store(supported, Ordering::SeqCst);
    }

    fn is_write_only(&self, index: usize) -> bool {
        self.write_only.read().contains(&index)
    }
}

impl ReplicaPool for MockPool {
    fn replica_for_read(&self) -> Option<Arc<dyn Replica>> {
        let index = self.primary.load(Ordering::SeqCst);
        self.replicas
            .get(index)
            .filter(|_| !self.is_write_only(index))
            .map(|r| Arc::clone(r) as Arc<dyn Replica>)
    }

    fn replicas_for_read_excluding(&self, group: &ServerGroup) -> Vec<Arc<dyn Replica>> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(i, r)| r.server_group() != group && !self.is_write_only(*i))
            .map(|(_, r)| Arc::clone(r) as Arc<dyn Replica>)
            .collect()
    }

    fn replicas_for_write(&self) -> Vec<Arc<dyn Replica>> {
        self.replicas
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn Replica>)
            .collect()
    }

    fn write_only_replicas(&self) -> Vec<Arc<dyn Replica>> {
        self.write_only
            .read()
            .iter()
            .filter_map(|&i| self.replicas.get(i))
            .map(|r| Arc::clone(r) as Arc<dyn Replica>)
            .collect()
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    fn supports_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPool")
            .field("replicas", &self.replicas.len())
            .finish()
    }
}

/// Listener that records every stage it sees.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub starts: AtomicUsize,
    pub completes: AtomicUsize,
    pub errors: AtomicUsize,
    pub last_status: Mutex<Option<String>>,
    pub last_attributes: Mutex<HashMap<String, String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status_attribute(&self) -> Option<String> {
        self.last_status.lock().clone()
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.last_attributes.lock().get(name).cloned()
    }
}

impl EventListener for RecordingListener {
    fn on_start(&self, _event: &CacheEvent) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_complete(&self, event: &CacheEvent) -> Result<()> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        *self.last_status.lock() = event.attribute("status");
        let mut attrs = self.last_attributes.lock();
        for name in ["status", "BHIT_PARTIAL_KEYS"] {
            if let Some(value) = event.attribute(name) {
                attrs.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn on_error(&self, event: &CacheEvent, _error: &Error) -> Result<()> {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_status.lock() = event.status();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Listener that rejects calls while its flag is up.
#[derive(Debug, Default)]
pub struct ThrottleListener {
    pub reject: AtomicBool,
}

impl ThrottleListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

impl EventListener for ThrottleListener {
    fn on_throttle(&self, _event: &CacheEvent) -> Result<bool> {
        Ok(self.reject.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "throttle"
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A fully wired client over mock replicas.
pub struct TestBed {
    pub client: CacheClient,
    pub replicas: Vec<Arc<MockReplica>>,
    pub pool: Arc<MockPool>,
    pub manager: Arc<PoolManager>,
    pub props: Arc<Properties>,
    pub bus: Arc<EventBus>,
}

impl TestBed {
    /// Build a client over one mock replica per `(group, zone)` pair.
    pub fn new(app: &str, prefix: Option<&str>, groups: &[(&str, &str)]) -> Self {
        let replicas: Vec<Arc<MockReplica>> = groups
            .iter()
            .map(|(name, zone)| MockReplica::new(name, zone))
            .collect();
        Self::with_replicas(app, prefix, replicas)
    }

    /// Build a client over caller-supplied replicas.
    pub fn with_replicas(
        app: &str,
        prefix: Option<&str>,
        replicas: Vec<Arc<MockReplica>>,
    ) -> Self {
        let pool = MockPool::new(replicas.clone());
        let manager = PoolManager::new();
        manager.register(app, pool.clone());
        let props = Properties::new();
        let bus = EventBus::new();

        let mut builder = CacheClient::builder(app, manager.clone())
            .properties(props.clone())
            .event_bus(bus.clone());
        if let Some(p) = prefix {
            builder = builder.prefix(p);
        }
        let client = builder.build().expect("test client builds");

        Self {
            client,
            replicas,
            pool,
            manager,
            props,
            bus,
        }
    }

    /// Seed the same value on a subset of replicas, using the client's own
    /// canonical key form.
    pub fn seed(&self, indexes: &[usize], key: &str, value: &str) {
        for &i in indexes {
            let replica = &self.replicas[i];
            let wire = self.wire_key(key, replica.is_duet());
            replica.seed(&wire, value);
        }
    }

    /// The wire key the client would use against a replica of the given
    /// duet-ness.
    pub fn wire_key(&self, key: &str, duet: bool) -> String {
        let ck = self.client.cache_key(key).expect("key normalises");
        ck.derived(duet).to_string()
    }
}
