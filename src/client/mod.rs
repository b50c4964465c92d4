//! The cache client facade.
//!
//! [`CacheClient`] mediates between application code issuing logical cache
//! operations and a pool of per-replica backends organised into failure
//! domains. Reads fall back across zones on miss, writes fan out to every
//! write replica behind a policy-driven latch, and an optional in-process
//! near cache fronts the whole thing.
//!
//! The facade is deliberately thin on state: per-call state lives on the
//! stack, and the only shared pieces are the pool (resolved through the
//! manager on every call so alias changes take effect live), the property
//! store, the event bus and the metric registry.

mod bulk;
mod read;
mod write;

use crate::config::{Prop, Properties};
use crate::error::{Error, Result};
use crate::event::{Call, CacheEvent, EventBus, EventDispatcher};
use crate::key::{CacheKey, HashAlgo};
use crate::latch::Policy;
use crate::metrics::{self, ClientMetrics};
use crate::near_cache::NearCache;
use crate::pool::{PoolManager, Replica, ReplicaPool};
use crate::value::EnvelopeTranscoder;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// TTLs above this are treated as absolute epoch seconds (30 days).
const MAX_RELATIVE_TTL_SECONDS: u64 = 2_592_000;

/// Builder for [`CacheClient`].
pub struct CacheClientBuilder {
    app_name: String,
    prefix: Option<String>,
    default_ttl: u64,
    zone_fallback: bool,
    throw_errors: bool,
    pool_manager: Arc<PoolManager>,
    properties: Option<Arc<Properties>>,
    event_bus: Option<Arc<EventBus>>,
}

impl CacheClientBuilder {
    /// Optional key prefix; the canonical key becomes `<prefix>:<key>`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Default TTL in seconds for writes that do not pass one.
    pub fn default_ttl(mut self, ttl: u64) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Base switch for zone fallback; the live property can still veto it.
    pub fn zone_fallback(mut self, enabled: bool) -> Self {
        self.zone_fallback = enabled;
        self
    }

    /// Base switch for propagating errors instead of returning misses.
    pub fn throw_errors(mut self, enabled: bool) -> Self {
        self.throw_errors = enabled;
        self
    }

    /// Shared property store. A fresh empty store is used when not set.
    pub fn properties(mut self, properties: Arc<Properties>) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Shared event bus. A fresh empty bus is used when not set.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<CacheClient> {
        if let Some(prefix) = &self.prefix {
            if prefix.is_empty() {
                return Err(Error::InvalidKey("prefix cannot be empty".to_string()));
            }
            if let Some(pos) = prefix.find(char::is_whitespace) {
                return Err(Error::InvalidKey(format!(
                    "prefix `{prefix}` contains whitespace at position {pos}"
                )));
            }
        }

        let app = self.app_name;
        let prefix = self.prefix;
        let props = self.properties.unwrap_or_else(Properties::new);
        let bus = self.event_bus.unwrap_or_else(EventBus::new);
        let metrics = Arc::new(ClientMetrics::new(&app, prefix.as_deref()));
        let dispatcher = EventDispatcher::new(Arc::clone(&bus), Arc::clone(&metrics));

        // Per-prefix keys override app-level keys, which override the
        // crate-wide defaults.
        let scoped = |suffix: &str| -> Vec<String> {
            let mut keys = Vec::with_capacity(3);
            if let Some(p) = &prefix {
                keys.push(format!("{app}.{p}.{suffix}"));
            }
            keys.push(format!("{app}.{suffix}"));
            keys.push(format!("doppio.{suffix}"));
            keys
        };
        let app_level = |suffix: &str| vec![format!("{app}.{suffix}")];

        let throw_fp = props.prop(scoped("throw.exception"), false);
        let fallback_fp = props.prop(scoped("fallback.zone"), true);
        let bulk_fallback_fp = props.prop(app_level("bulk.fallback.zone"), true);
        let bulk_partial_fallback_fp = props.prop(app_level("bulk.partial.fallback.zone"), true);
        let near_cache_fp = props.prop(scoped("use.inmemory.cache"), false);
        let events_latch_fp = props.prop(scoped("events.using.latch"), false);
        let ignore_touch_fp = props.prop(app_level("ignore.touch"), false);
        let hash_key_fp = props.prop(app_level("hash.key"), false);
        let auto_hash_fp = props.prop(scoped("auto.hash.keys"), false);
        let hash_algo_fp = props.prop(app_level("hash.algo"), "siphash24".to_string());
        let max_key_length_fp = props.prop(scoped("max.key.length"), 200u32);
        let max_read_ms_fp = props.prop(scoped("max.read.duration.metric"), 20u64);
        let max_write_ms_fp = props.prop(scoped("max.write.duration.metric"), 50u64);
        let near_capacity_fp = props.prop(app_level("inmemory.cache.size"), 10_000u64);
        let near_ttl_ms_fp = props.prop(app_level("inmemory.cache.ttl.ms"), 30_000u64);
        let near_tti_ms_fp = props.prop(app_level("inmemory.cache.tti.ms"), 0u64);
        let alias_key = format!("PoolManager.{app}.alias");

        Ok(CacheClient {
            throw_fp,
            fallback_fp,
            bulk_fallback_fp,
            bulk_partial_fallback_fp,
            near_cache_fp,
            events_latch_fp,
            ignore_touch_fp,
            hash_key_fp,
            auto_hash_fp,
            hash_algo_fp,
            max_key_length_fp,
            max_read_ms_fp,
            max_write_ms_fp,
            near_capacity_fp,
            near_ttl_ms_fp,
            near_tti_ms_fp,
            alias_key,
            app_name: app,
            prefix,
            default_ttl: self.default_ttl,
            zone_fallback: self.zone_fallback,
            throw_errors: self.throw_errors,
            pool_manager: self.pool_manager,
            props,
            bus,
            metrics,
            dispatcher,
            near: OnceLock::new(),
            envelope: EnvelopeTranscoder,
        })
    }
}

/// Client facade over a pool of multi-zone cache replicas.
pub struct CacheClient {
    app_name: String,
    prefix: Option<String>,
    default_ttl: u64,
    zone_fallback: bool,
    throw_errors: bool,

    pool_manager: Arc<PoolManager>,
    props: Arc<Properties>,
    bus: Arc<EventBus>,
    metrics: Arc<ClientMetrics>,
    dispatcher: EventDispatcher,
    near: OnceLock<NearCache>,
    envelope: EnvelopeTranscoder,

    throw_fp: Prop<bool>,
    fallback_fp: Prop<bool>,
    bulk_fallback_fp: Prop<bool>,
    bulk_partial_fallback_fp: Prop<bool>,
    near_cache_fp: Prop<bool>,
    events_latch_fp: Prop<bool>,
    ignore_touch_fp: Prop<bool>,
    hash_key_fp: Prop<bool>,
    auto_hash_fp: Prop<bool>,
    hash_algo_fp: Prop<String>,
    max_key_length_fp: Prop<u32>,
    max_read_ms_fp: Prop<u64>,
    max_write_ms_fp: Prop<u64>,
    near_capacity_fp: Prop<u64>,
    near_ttl_ms_fp: Prop<u64>,
    near_tti_ms_fp: Prop<u64>,
    alias_key: String,
}

impl CacheClient {
    /// Start building a client for the given application.
    pub fn builder(app_name: impl Into<String>, pool_manager: Arc<PoolManager>) -> CacheClientBuilder {
        CacheClientBuilder {
            app_name: app_name.into(),
            prefix: None,
            default_ttl: 900,
            zone_fallback: true,
            throw_errors: false,
            pool_manager,
            properties: None,
            event_bus: None,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// The metric registry, exposed for scraping and tests.
    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// The event bus this client dispatches through. Listeners registered
    /// here affect subsequent calls.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Resolve the pool through the manager, honouring the alias property.
    pub(crate) fn pool(&self) -> Option<Arc<dyn ReplicaPool>> {
        let target = self
            .props
            .lookup(&self.alias_key)
            .unwrap_or_else(|| self.app_name.clone());
        self.pool_manager.pool_for(&target)
    }

    pub(crate) fn do_throw(&self) -> bool {
        self.throw_errors || self.throw_fp.get()
    }

    pub(crate) fn has_zone_fallback(&self, pool: &dyn ReplicaPool) -> bool {
        pool.supports_fallback() && self.fallback_fp.get() && self.zone_fallback
    }

    pub(crate) fn has_bulk_fallback(&self, pool: &dyn ReplicaPool) -> bool {
        pool.supports_fallback() && self.bulk_fallback_fp.get() && self.zone_fallback
    }

    pub(crate) fn use_near_cache(&self) -> bool {
        self.near_cache_fp.get()
    }

    pub(crate) fn ignore_touch(&self) -> bool {
        self.ignore_touch_fp.get()
    }

    pub(crate) fn events_using_latch(&self) -> bool {
        self.events_latch_fp.get()
    }

    pub(crate) fn max_read_ms(&self) -> u64 {
        self.max_read_ms_fp.get()
    }

    pub(crate) fn max_write_ms(&self) -> u64 {
        self.max_write_ms_fp.get()
    }

    pub(crate) fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub(crate) fn envelope(&self) -> &EnvelopeTranscoder {
        &self.envelope
    }

    pub(crate) fn near_cache(&self) -> &NearCache {
        self.near.get_or_init(|| {
            let ttl = self.near_ttl_ms_fp.get();
            let tti = self.near_tti_ms_fp.get();
            NearCache::new(
                self.near_capacity_fp.get(),
                (ttl > 0).then(|| Duration::from_millis(ttl)),
                (tti > 0).then(|| Duration::from_millis(tti)),
            )
        })
    }

    /// Normalise an application key under the live hashing configuration.
    pub(crate) fn cache_key(&self, key: &str) -> Result<CacheKey> {
        CacheKey::new(
            key,
            self.prefix.as_deref(),
            self.hash_key_fp.get(),
            self.auto_hash_fp.get(),
            self.max_key_length_fp.get() as usize,
            HashAlgo::parse(&self.hash_algo_fp.get()),
        )
    }

    /// Validate a TTL in seconds against memcached conventions: a value
    /// larger than the current wall-clock milliseconds means the caller
    /// passed milliseconds by mistake; a value above 30 days is an absolute
    /// epoch timestamp and must be in the future. Negative TTLs are
    /// unrepresentable by the type.
    pub(crate) fn check_ttl(&self, ttl: u64, call: Call) -> Result<()> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let reason = if ttl > now_ms {
            Some("ttl must be in seconds, not milliseconds")
        } else if ttl > MAX_RELATIVE_TTL_SECONDS && ttl < now_ms / 1000 {
            Some("epoch-style ttl must be greater than the current time")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                self.metrics.fast_fail(metrics::REASON_INVALID_TTL, call);
                Err(Error::InvalidTtl { ttl, reason })
            }
            None => Ok(()),
        }
    }

    /// Create an event when listeners are installed, run the throttle stage
    /// and fire the start hooks. Returns `Err(Throttled)` when a listener
    /// rejects the call; the caller converts per its throw flag.
    pub(crate) fn open_event(
        &self,
        call: Call,
        keys: &[CacheKey],
        ttl: Option<u64>,
    ) -> Result<Option<Arc<CacheEvent>>> {
        let Some(event) = self.dispatcher.create(call, &self.app_name, self.prefix.as_deref())
        else {
            return Ok(None);
        };
        event.set_keys(keys.to_vec());
        if let Some(ttl) = ttl {
            event.set_ttl(ttl);
        }
        if self.dispatcher.throttle(&event) {
            self.metrics.fast_fail(metrics::REASON_THROTTLED, call);
            return Err(Error::Throttled {
                app: self.app_name.clone(),
                key: keys.first().map(|k| k.app_key().to_string()).unwrap_or_default(),
            });
        }
        self.dispatcher.start(&event);
        Ok(Some(event))
    }

    /// Fast-fail bookkeeping when the pool has no replica for the call.
    pub(crate) fn no_replica(&self, call: Call) -> Error {
        self.metrics.fast_fail(metrics::REASON_NULL_CLIENT, call);
        Error::NoReplica {
            app: self.app_name.clone(),
        }
    }

    /// Touch every write replica with the given TTL. Used by get-and-touch
    /// and bulk-and-touch after a hit, and by append to refresh lifetimes.
    pub(crate) async fn touch_replicas(&self, key: &CacheKey, ttl: u64) -> Result<()> {
        let Some(pool) = self.pool() else {
            return Err(self.no_replica(Call::Touch));
        };
        for replica in pool.replicas_for_write() {
            if let Err(e) = replica.touch(key.derived(replica.is_duet()), ttl).await {
                debug!(
                    app = %self.app_name,
                    key = %key,
                    group = %replica.server_group(),
                    error = %e,
                    "touch failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Effective write policy: callers that pass nothing get all-minus-one.
    pub(crate) fn effective_policy(&self, policy: Option<Policy>) -> Policy {
        policy.unwrap_or(Policy::AllMinusOne)
    }

    /// The write set plus its counted size (total minus write-only).
    pub(crate) fn write_set(&self, pool: &dyn ReplicaPool) -> (Vec<Arc<dyn Replica>>, usize) {
        let writers = pool.replicas_for_write();
        let write_only = pool.write_only_replicas();
        let counted = writers
            .iter()
            .filter(|w| !write_only.iter().any(|wo| Arc::ptr_eq(w, wo)))
            .count();
        (writers, counted)
    }

    /// Whether the given writer participates in the latch count.
    pub(crate) fn is_counted(replica: &Arc<dyn Replica>, write_only: &[Arc<dyn Replica>]) -> bool {
        !write_only.iter().any(|wo| Arc::ptr_eq(replica, wo))
    }
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("app_name", &self.app_name)
            .field("prefix", &self.prefix)
            .field("default_ttl", &self.default_ttl)
            .field("zone_fallback", &self.zone_fallback)
            .finish()
    }
}
