//! Single-key read orchestration: get, meta-get, meta-debug, get-and-touch
//! and consistent reads.

use super::CacheClient;
use crate::error::{Error, Result};
use crate::event::{Call, CacheEvent};
use crate::key::CacheKey;
use crate::latch::Policy;
use crate::metrics::{
    HIT_NO, HIT_YES, REASON_KEY_HASH_COLLISION, RESULT_ERROR, RESULT_SUCCESS, RESULT_THROTTLED,
    RESULT_TIMEOUT,
};
use crate::near_cache::NearEntry;
use crate::pool::{ItemMetadata, MetaItem, Replica, ReplicaPool};
use crate::value::{CachedData, Transcoder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which replica operation a single-key read issues.
#[derive(Debug, Clone, Copy)]
enum ReadKind {
    Data,
    Meta,
    MetaDebug,
}

/// Result of a single-key read, before decoding.
enum ReadPayload {
    Data(CachedData),
    Meta(MetaItem),
    Debug(ItemMetadata),
}

impl CacheClient {
    /// Get the value for a key, decoded with the given transcoder.
    ///
    /// On a primary miss the read falls back across the other server groups
    /// in pool order, stopping at the first hit. Returns `Ok(None)` on miss,
    /// and on failure too unless the throw flag is set.
    pub async fn get<T>(&self, key: &str, tc: &dyn Transcoder<T>) -> Result<Option<T>> {
        let ck = self.cache_key(key)?;
        let data = self.get_data(&ck).await?;
        self.decode(data, tc)
    }

    /// Get the raw payload for a key, consulting the near cache if enabled.
    pub(crate) async fn get_data(&self, ck: &CacheKey) -> Result<Option<CachedData>> {
        if self.use_near_cache() {
            let canonical = ck.canonical(false).to_string();
            let load = self.single_read(Call::Get, ck, ("GHIT", "GMISS"), true, None);
            match self.near_cache().get_or_load(&canonical, load).await {
                Ok(data) => Ok(data),
                Err(e) => {
                    debug!(app = %self.app_name, key = %ck, error = %e, "near-cache load failed");
                    if self.do_throw() {
                        Err(e)
                    } else {
                        Ok(None)
                    }
                }
            }
        } else {
            self.single_read(Call::Get, ck, ("GHIT", "GMISS"), false, None).await
        }
    }

    /// Get a value together with its item metadata.
    pub async fn meta_get(&self, key: &str) -> Result<Option<MetaItem>> {
        let ck = self.cache_key(key)?;
        match self
            .orchestrate_read(Call::MetaGet, &ck, ("MGHIT", "MGMISS"), ReadKind::Meta, false, None)
            .await?
        {
            Some(ReadPayload::Meta(item)) => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    /// Get debug metadata for a key without fetching its value.
    pub async fn meta_debug(&self, key: &str) -> Result<Option<ItemMetadata>> {
        let ck = self.cache_key(key)?;
        match self
            .orchestrate_read(
                Call::MetaDebug,
                &ck,
                ("MDHIT", "MDMISS"),
                ReadKind::MetaDebug,
                false,
                None,
            )
            .await?
        {
            Some(ReadPayload::Debug(meta)) => Ok(Some(meta)),
            _ => Ok(None),
        }
    }

    /// Get a value and refresh its TTL on every write replica.
    ///
    /// Degrades to a plain get when the ignore-touch property is set.
    pub async fn get_and_touch<T>(
        &self,
        key: &str,
        ttl: u64,
        tc: &dyn Transcoder<T>,
    ) -> Result<Option<T>> {
        self.check_ttl(ttl, Call::GetAndTouch)?;
        let ck = self.cache_key(key)?;

        if self.ignore_touch() {
            let data = self.get_data(&ck).await?;
            return self.decode(data, tc);
        }

        // A near-cache hit still refreshes the backend copies.
        if self.use_near_cache() {
            if let Some(NearEntry::Found(data)) = self.near_cache().peek(ck.canonical(false)).await
            {
                if let Err(e) = self.touch_replicas(&ck, ttl).await {
                    if self.do_throw() {
                        return Err(e);
                    }
                }
                return self.decode(Some(data), tc);
            }
        }

        let data = self
            .single_read(Call::GetAndTouch, &ck, ("THIT", "TMISS"), false, Some(ttl))
            .await?;
        self.decode(data, tc)
    }

    /// Consistent read: query every write replica and return a value only
    /// when at least the policy-required number of replicas agree on it.
    ///
    /// Minority copies receive best-effort repair deletes. Policies whose
    /// threshold is one or less degrade to a normal single-replica read.
    pub async fn get_consistent<T>(
        &self,
        key: &str,
        tc: &dyn Transcoder<T>,
        policy: Policy,
    ) -> Result<Option<T>> {
        let call = Call::GetAll;
        let throw = self.do_throw();
        let Some(pool) = self.pool() else {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(None) };
        };
        let writers = pool.replicas_for_write();
        if writers.is_empty() {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(None) };
        }

        let required = policy.required(writers.len());
        if required <= 1 {
            return self.get(key, tc).await;
        }

        let ck = self.cache_key(key)?;
        let start = Instant::now();
        let deadline = start + pool.read_timeout();

        let mut handles = Vec::with_capacity(writers.len());
        for replica in &writers {
            let replica = Arc::clone(replica);
            let wire_key = ck.derived(replica.is_duet()).to_string();
            handles.push(tokio::spawn(async move { replica.get(&wire_key).await }));
        }

        // Buckets of (value, replicas that returned it), in replica order.
        let mut buckets: Vec<(CachedData, Vec<usize>)> = Vec::new();
        for (idx, handle) in handles.into_iter().enumerate() {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(20));
            let data = match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(Ok(data))) => data,
                Ok(Ok(Err(e))) => {
                    debug!(app = %self.app_name, key = %ck, error = %e, "consistent read attempt failed");
                    None
                }
                Ok(Err(join)) => {
                    debug!(app = %self.app_name, key = %ck, error = %join, "consistent read task failed");
                    None
                }
                Err(_) => None,
            };
            let Some(data) = data else { continue };
            let data = if ck.hashed().is_some() {
                match self.unseal(&ck, writers[idx].is_duet(), &data, call) {
                    Some(inner) => inner,
                    None => continue,
                }
            } else {
                data
            };
            match buckets.iter_mut().find(|(value, _)| *value == data) {
                Some((_, members)) => members.push(idx),
                None => buckets.push((data, vec![idx])),
            }
        }

        // Largest bucket first; the sort is stable, so equal sizes keep the
        // write-order of their first replica.
        buckets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        let winner = buckets
            .iter()
            .position(|(_, members)| members.len() >= required);

        for (i, (_, members)) in buckets.iter().enumerate() {
            if Some(i) == winner {
                continue;
            }
            for &idx in members {
                let replica = &writers[idx];
                let wire_key = ck.derived(replica.is_duet());
                if let Err(e) = replica.delete(wire_key).await {
                    debug!(
                        app = %self.app_name,
                        key = %ck,
                        group = %replica.server_group(),
                        error = %e,
                        "repair delete failed"
                    );
                }
            }
        }

        let hit = if winner.is_some() { HIT_YES } else { HIT_NO };
        self.metrics
            .operation_timer(call, Some(hit), RESULT_SUCCESS, 1, None, self.max_read_ms())
            .record(start.elapsed());

        match winner {
            Some(i) => self.decode(Some(buckets[i].0.clone()), tc),
            None => Ok(None),
        }
    }

    /// Decode a payload, converting failures to misses unless throwing.
    pub(crate) fn decode<T>(
        &self,
        data: Option<CachedData>,
        tc: &dyn Transcoder<T>,
    ) -> Result<Option<T>> {
        match data {
            Some(d) => match tc.decode(&d) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    debug!(app = %self.app_name, error = %e, "payload decode failed");
                    if self.do_throw() {
                        Err(e)
                    } else {
                        Ok(None)
                    }
                }
            },
            None => Ok(None),
        }
    }

    /// Single-key data read with zone fallback.
    ///
    /// `propagate_faults` forces faults out as errors regardless of the
    /// throw flag; the near cache uses it so a failed load is never cached
    /// as a miss.
    pub(crate) async fn single_read(
        &self,
        call: Call,
        ck: &CacheKey,
        statuses: (&'static str, &'static str),
        propagate_faults: bool,
        touch_ttl: Option<u64>,
    ) -> Result<Option<CachedData>> {
        match self
            .orchestrate_read(call, ck, statuses, ReadKind::Data, propagate_faults, touch_ttl)
            .await?
        {
            Some(ReadPayload::Data(d)) => Ok(Some(d)),
            _ => Ok(None),
        }
    }

    /// The core single-key read path: event lifecycle, primary read, ordered
    /// zone fallback, status attributes and the overall-call timer.
    async fn orchestrate_read(
        &self,
        call: Call,
        ck: &CacheKey,
        (hit_status, miss_status): (&'static str, &'static str),
        kind: ReadKind,
        propagate_faults: bool,
        touch_ttl: Option<u64>,
    ) -> Result<Option<ReadPayload>> {
        let throw = self.do_throw();
        let surface = |e: Error| -> Result<Option<ReadPayload>> {
            if throw || propagate_faults {
                Err(e)
            } else {
                Ok(None)
            }
        };

        let Some(pool) = self.pool() else {
            return surface(self.no_replica(call));
        };
        let Some(primary) = pool.replica_for_read() else {
            return surface(self.no_replica(call));
        };

        let event = match self.open_event(call, std::slice::from_ref(ck), touch_ttl) {
            Ok(event) => event,
            Err(e) => return surface(e),
        };

        let start = Instant::now();
        let has_zf = self.has_zone_fallback(pool.as_ref());
        let mut tries = 1usize;
        let mut group = primary.server_group().clone();

        let mut attempt = self
            .read_attempts(
                call, ck, kind, &pool, &primary, &event, has_zf, throw, &mut tries, &mut group,
            )
            .await;

        // Get-and-touch refreshes every copy once a hit is in hand.
        if let (Ok(Some(_)), Some(ttl)) = (&attempt, touch_ttl) {
            if let Err(e) = self.touch_replicas(ck, ttl).await {
                attempt = Err(e);
            }
        }

        let (result, hit, status) = match attempt {
            Ok(payload) => {
                let hit = if payload.is_some() {
                    if let Some(ev) = &event {
                        ev.set_attribute("status", hit_status);
                    }
                    HIT_YES
                } else {
                    if let Some(ev) = &event {
                        ev.set_attribute("status", miss_status);
                    }
                    debug!(app = %self.app_name, key = %ck, call = %call, "cache miss");
                    HIT_NO
                };
                if let Some(ev) = &event {
                    self.dispatcher().complete(ev);
                }
                (Ok(payload), hit, RESULT_SUCCESS)
            }
            Err(e) => {
                let status = match &e {
                    Error::Throttled { .. } => RESULT_THROTTLED,
                    Error::Timeout(_) => RESULT_TIMEOUT,
                    _ => RESULT_ERROR,
                };
                if let Some(ev) = &event {
                    ev.set_status(status);
                    self.dispatcher().error(ev, &e);
                }
                (surface(self.read_failure(call, ck, e)), HIT_NO, status)
            }
        };

        self.metrics
            .operation_timer(call, Some(hit), status, tries, Some(&group), self.max_read_ms())
            .record(start.elapsed());
        result
    }

    /// Primary attempt plus ordered fallback. Every attempt but the last
    /// swallows faults; the last honours the throw flag.
    #[allow(clippy::too_many_arguments)]
    async fn read_attempts(
        &self,
        call: Call,
        ck: &CacheKey,
        kind: ReadKind,
        pool: &Arc<dyn ReplicaPool>,
        primary: &Arc<dyn Replica>,
        event: &Option<Arc<CacheEvent>>,
        has_zf: bool,
        throw: bool,
        tries: &mut usize,
        group: &mut crate::pool::ServerGroup,
    ) -> Result<Option<ReadPayload>> {
        let propagate_primary = throw && !has_zf;
        let mut payload = self.read_once(primary, ck, kind, call, propagate_primary).await?;

        if payload.is_none() && has_zf {
            let fallbacks = pool.replicas_for_read_excluding(primary.server_group());
            for (i, fallback) in fallbacks.iter().enumerate() {
                if let Some(ev) = event {
                    if self.dispatcher().throttle(ev) {
                        return Err(Error::Throttled {
                            app: self.app_name.clone(),
                            key: ck.app_key().to_string(),
                        });
                    }
                }
                *tries += 1;
                let last = i + 1 == fallbacks.len();
                payload = self.read_once(fallback, ck, kind, call, last && throw).await?;
                debug!(
                    app = %self.app_name,
                    key = %ck,
                    group = %fallback.server_group(),
                    hit = payload.is_some(),
                    "fallback read"
                );
                if payload.is_some() {
                    *group = fallback.server_group().clone();
                    break;
                }
            }
        }
        Ok(payload)
    }

    /// One replica read. Faults are swallowed to a miss unless `propagate`.
    async fn read_once(
        &self,
        replica: &Arc<dyn Replica>,
        ck: &CacheKey,
        kind: ReadKind,
        call: Call,
        propagate: bool,
    ) -> Result<Option<ReadPayload>> {
        let duet = replica.is_duet();
        let outcome = match kind {
            ReadKind::Data => self
                .fetch_data(replica.as_ref(), ck, call)
                .await
                .map(|o| o.map(ReadPayload::Data)),
            ReadKind::Meta => self
                .fetch_meta(replica.as_ref(), ck, call)
                .await
                .map(|o| o.map(ReadPayload::Meta)),
            ReadKind::MetaDebug => replica
                .meta_debug(ck.derived(duet))
                .await
                .map(|o| o.map(ReadPayload::Debug)),
        };
        match outcome {
            Err(e) if !propagate => {
                debug!(
                    app = %self.app_name,
                    key = %ck,
                    group = %replica.server_group(),
                    error = %e,
                    "replica read failed, treating as miss"
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Fetch one payload, unwrapping the hashed-key envelope when in effect.
    async fn fetch_data(
        &self,
        replica: &dyn Replica,
        ck: &CacheKey,
        call: Call,
    ) -> Result<Option<CachedData>> {
        let duet = replica.is_duet();
        match ck.hashed() {
            Some(hashed) => match replica.get(hashed).await? {
                Some(data) => Ok(self.unseal(ck, duet, &data, call)),
                None => Ok(None),
            },
            None => replica.get(ck.canonical(duet)).await,
        }
    }

    /// Fetch one item with its metadata, unwrapping the hashed-key envelope
    /// when in effect. A collision drops the item as a miss.
    async fn fetch_meta(
        &self,
        replica: &dyn Replica,
        ck: &CacheKey,
        call: Call,
    ) -> Result<Option<MetaItem>> {
        let duet = replica.is_duet();
        match replica.meta_get(ck.derived(duet)).await? {
            Some(item) if ck.hashed().is_some() => {
                Ok(self.unseal(ck, duet, &item.data, call).map(|data| MetaItem {
                    data,
                    metadata: item.metadata,
                }))
            }
            other => Ok(other),
        }
    }

    /// Open a sealed payload and verify it belongs to the requested key.
    /// A mismatch is a hash collision: counted, returned as a miss.
    pub(crate) fn unseal(
        &self,
        ck: &CacheKey,
        duet: bool,
        data: &CachedData,
        call: Call,
    ) -> Option<CachedData> {
        match self.envelope().open(data) {
            Ok(sealed) => {
                if sealed.canonical_key == ck.canonical(duet) {
                    Some(CachedData::new(sealed.flags, sealed.payload))
                } else {
                    self.metrics.internal_fail(REASON_KEY_HASH_COLLISION, call);
                    debug!(app = %self.app_name, key = %ck, "hashed key collision");
                    None
                }
            }
            Err(e) => {
                debug!(app = %self.app_name, key = %ck, error = %e, "failed to open sealed value");
                None
            }
        }
    }

    /// Add operational context to a fault that is about to be thrown.
    fn read_failure(&self, call: Call, ck: &CacheKey, e: Error) -> Error {
        match e {
            Error::Timeout(inner) => Error::Timeout(format!(
                "{call} timed out for app {app}, key {ck}: {inner}; \
                 you can increase {app}.pool.read.timeout.ms",
                app = self.app_name,
            )),
            other => other,
        }
    }
}
