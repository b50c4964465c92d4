//! Multi-key read orchestration with full and per-missing-key fallback.

use super::CacheClient;
use crate::error::{Error, Result};
use crate::event::{Call, CacheEvent};
use crate::key::CacheKey;
use crate::metrics::{
    HIT_NO, HIT_PARTIAL, HIT_YES, RESULT_ERROR, RESULT_SUCCESS, RESULT_THROTTLED, RESULT_TIMEOUT,
};
use crate::near_cache::NearEntry;
use crate::pool::{Replica, ReplicaPool};
use crate::value::{CachedData, Transcoder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

impl CacheClient {
    /// Get many keys at once.
    ///
    /// The returned map carries an entry per resolved key. On a full miss
    /// every requested key is present, mapped to `None`; on a partial hit
    /// only the resolved keys are present.
    pub async fn get_bulk<T, I, S>(
        &self,
        keys: I,
        tc: &dyn Transcoder<T>,
    ) -> Result<HashMap<String, Option<T>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        self.bulk(keys, tc, None).await
    }

    /// Get many keys and refresh the TTL of every key that resolved.
    pub async fn get_bulk_and_touch<T, I, S>(
        &self,
        keys: I,
        tc: &dyn Transcoder<T>,
        ttl: u64,
    ) -> Result<HashMap<String, Option<T>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        self.bulk(keys, tc, Some(ttl)).await
    }

    async fn bulk<T>(
        &self,
        keys: Vec<String>,
        tc: &dyn Transcoder<T>,
        touch_ttl: Option<u64>,
    ) -> Result<HashMap<String, Option<T>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let call = if touch_ttl.is_some() {
            Call::BulkAndTouch
        } else {
            Call::Bulk
        };
        if let Some(ttl) = touch_ttl {
            self.check_ttl(ttl, call)?;
        }

        let throw = self.do_throw();
        let empty = HashMap::new;
        let Some(pool) = self.pool() else {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(empty()) };
        };
        let Some(primary) = pool.replica_for_read() else {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(empty()) };
        };

        // Normalise every key, consulting the near cache for pre-fills.
        let mut near_hits: Vec<(String, CachedData)> = Vec::new();
        let mut pending: Vec<CacheKey> = Vec::new();
        for key in &keys {
            let ck = self.cache_key(key)?;
            if self.use_near_cache() {
                if let Some(NearEntry::Found(data)) =
                    self.near_cache().peek(ck.canonical(false)).await
                {
                    near_hits.push((ck.app_key().to_string(), data));
                    continue;
                }
            }
            pending.push(ck);
        }

        if pending.is_empty() {
            let mut out = HashMap::with_capacity(near_hits.len());
            for (app_key, data) in near_hits {
                if let Some(value) = self.decode(Some(data), tc)? {
                    out.insert(app_key, Some(value));
                }
            }
            return Ok(out);
        }

        let event = match self.open_event(call, &pending, touch_ttl) {
            Ok(event) => event,
            Err(e) => return if throw { Err(e) } else { Ok(empty()) },
        };

        let start = Instant::now();
        let mut tries = 1usize;
        let group = primary.server_group().clone();

        let attempt = self
            .bulk_attempts(call, &pending, &pool, &primary, &event, throw, &mut tries)
            .await;

        let (result, hit, status) = match attempt {
            Ok((fetched, primary_hits)) => {
                self.assemble_bulk(
                    call, &keys, near_hits, &pending, fetched, primary_hits, touch_ttl, tc, &event,
                )
                .await
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
                let result = if throw {
                    Err(self.bulk_failure(call, e))
                } else {
                    Ok(empty())
                };
                (result, HIT_NO, status)
            }
        };

        self.metrics.bulk_keys_summary().record(keys.len() as u64);
        self.metrics
            .operation_timer(call, Some(hit), status, tries, Some(&group), self.max_read_ms())
            .record(start.elapsed());
        result
    }

    /// Primary bulk read plus full or per-missing-key fallback.
    ///
    /// Returns the fetched map keyed by canonical key (`None` when the
    /// primary failed and was swallowed), and the primary-phase hit keys
    /// when partial fallback engaged.
    #[allow(clippy::type_complexity)]
    async fn bulk_attempts(
        &self,
        call: Call,
        pending: &[CacheKey],
        pool: &Arc<dyn ReplicaPool>,
        primary: &Arc<dyn Replica>,
        event: &Option<Arc<CacheEvent>>,
        throw: bool,
        tries: &mut usize,
    ) -> Result<(Option<HashMap<String, CachedData>>, Option<Vec<String>>)> {
        let has_zf = self.has_bulk_fallback(pool.as_ref());
        let propagate = throw && !has_zf;
        let mut fetched = self.bulk_fetch(primary, pending, call, propagate).await?;
        let mut primary_hits = None;

        if !has_zf {
            return Ok((fetched, primary_hits));
        }

        if fetched.as_ref().map_or(true, |m| m.is_empty()) {
            // Nothing came back: retry the full set in other zones.
            let fallbacks = pool.replicas_for_read_excluding(primary.server_group());
            for (i, fallback) in fallbacks.iter().enumerate() {
                self.recheck_throttle(event, pending)?;
                *tries += 1;
                let last = i + 1 == fallbacks.len();
                fetched = self.bulk_fetch(fallback, pending, call, last && throw).await?;
                if fetched.as_ref().is_some_and(|m| !m.is_empty()) {
                    break;
                }
            }
        } else if fetched.as_ref().is_some_and(|m| m.len() < pending.len())
            && self.bulk_partial_fallback_fp.get()
        {
            // Some keys resolved; chase only the remainder across zones.
            let mut map = fetched.take().unwrap_or_default();
            primary_hits = Some(
                pending
                    .iter()
                    .filter(|ck| map.contains_key(ck.canonical(false)))
                    .map(|ck| ck.app_key().to_string())
                    .collect(),
            );
            let fallbacks = pool.replicas_for_read_excluding(primary.server_group());
            for fallback in &fallbacks {
                let remainder: Vec<CacheKey> = pending
                    .iter()
                    .filter(|ck| !map.contains_key(ck.canonical(false)))
                    .cloned()
                    .collect();
                if remainder.is_empty() {
                    break;
                }
                self.recheck_throttle(event, &remainder)?;
                *tries += 1;
                if let Some(partial) = self.bulk_fetch(fallback, &remainder, call, false).await? {
                    debug!(
                        app = %self.app_name,
                        group = %fallback.server_group(),
                        resolved = partial.len(),
                        outstanding = remainder.len(),
                        "partial bulk fallback"
                    );
                    map.extend(partial);
                }
            }
            fetched = Some(map);
        }

        Ok((fetched, primary_hits))
    }

    /// One bulk read against one replica. Results come back keyed by the
    /// canonical (non-duet) key; sealed entries are verified against their
    /// envelope and collisions dropped as misses.
    async fn bulk_fetch(
        &self,
        replica: &Arc<dyn Replica>,
        keys: &[CacheKey],
        call: Call,
        propagate: bool,
    ) -> Result<Option<HashMap<String, CachedData>>> {
        let duet = replica.is_duet();
        let mut wire_keys = Vec::with_capacity(keys.len());
        let mut index: HashMap<&str, &CacheKey> = HashMap::with_capacity(keys.len());
        for ck in keys {
            let wire = ck.derived(duet);
            index.insert(wire, ck);
            wire_keys.push(wire.to_string());
        }

        match replica.get_bulk(&wire_keys).await {
            Ok(map) => {
                let mut out = HashMap::with_capacity(map.len());
                for (wire, data) in map {
                    let Some(ck) = index.get(wire.as_str()) else {
                        continue;
                    };
                    let data = if ck.hashed().is_some() {
                        match self.unseal(ck, duet, &data, call) {
                            Some(inner) => inner,
                            None => continue,
                        }
                    } else {
                        data
                    };
                    out.insert(ck.canonical(false).to_string(), data);
                }
                Ok(Some(out))
            }
            Err(e) if !propagate => {
                debug!(
                    app = %self.app_name,
                    group = %replica.server_group(),
                    error = %e,
                    "bulk read failed, treating as empty"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Decode, touch and status-tag the assembled result set.
    #[allow(clippy::too_many_arguments)]
    async fn assemble_bulk<T>(
        &self,
        call: Call,
        keys: &[String],
        near_hits: Vec<(String, CachedData)>,
        pending: &[CacheKey],
        fetched: Option<HashMap<String, CachedData>>,
        primary_hits: Option<Vec<String>>,
        touch_ttl: Option<u64>,
        tc: &dyn Transcoder<T>,
        event: &Option<Arc<CacheEvent>>,
    ) -> (
        Result<HashMap<String, Option<T>>>,
        &'static str,
        &'static str,
    ) {
        let fetched_empty = fetched.as_ref().map_or(true, |m| m.is_empty());
        if near_hits.is_empty() && fetched_empty {
            debug!(app = %self.app_name, keys = keys.len(), "full bulk miss");
            if let Some(ev) = event {
                ev.set_attribute("status", "BMISS_ALL");
                self.dispatcher().complete(ev);
            }
            // A swallowed failure yields an empty map; a true full miss maps
            // every requested key to nothing.
            let out = match fetched {
                Some(_) => keys.iter().map(|k| (k.clone(), None)).collect(),
                None => HashMap::new(),
            };
            return (Ok(out), HIT_NO, RESULT_SUCCESS);
        }

        let map = fetched.unwrap_or_default();
        let mut out = HashMap::with_capacity(keys.len());
        let mut partial = false;

        for (app_key, data) in near_hits {
            match self.decode(Some(data), tc) {
                Ok(Some(value)) => {
                    out.insert(app_key, Some(value));
                }
                Ok(None) => partial = true,
                Err(e) => return self.bulk_error(call, event, e),
            }
        }

        for ck in pending {
            match map.get(ck.canonical(false)) {
                Some(data) => match self.decode(Some(data.clone()), tc) {
                    Ok(Some(value)) => {
                        if let Some(ttl) = touch_ttl {
                            if let Err(e) = self.touch_replicas(ck, ttl).await {
                                return self.bulk_error(call, event, e);
                            }
                        }
                        out.insert(ck.app_key().to_string(), Some(value));
                    }
                    Ok(None) => partial = true,
                    Err(e) => return self.bulk_error(call, event, e),
                },
                None => partial = true,
            }
        }

        let hit = if let Some(ev) = event {
            if partial || primary_hits.is_some() {
                ev.set_attribute("status", "BHIT_PARTIAL");
                if let Some(hits) = &primary_hits {
                    ev.set_attribute("BHIT_PARTIAL_KEYS", hits.join(","));
                }
                HIT_PARTIAL
            } else {
                ev.set_attribute("status", "BHIT");
                HIT_YES
            }
        } else if partial || primary_hits.is_some() {
            HIT_PARTIAL
        } else {
            HIT_YES
        };
        if let Some(ev) = event {
            self.dispatcher().complete(ev);
        }
        (Ok(out), hit, RESULT_SUCCESS)
    }

    fn bulk_error<T>(
        &self,
        call: Call,
        event: &Option<Arc<CacheEvent>>,
        e: Error,
    ) -> (
        Result<HashMap<String, Option<T>>>,
        &'static str,
        &'static str,
    ) {
        let status = if e.is_timeout() {
            RESULT_TIMEOUT
        } else {
            RESULT_ERROR
        };
        if let Some(ev) = event {
            ev.set_status(status);
            self.dispatcher().error(ev, &e);
        }
        let result = if self.do_throw() {
            Err(self.bulk_failure(call, e))
        } else {
            Ok(HashMap::new())
        };
        (result, HIT_NO, status)
    }

    fn recheck_throttle(&self, event: &Option<Arc<CacheEvent>>, keys: &[CacheKey]) -> Result<()> {
        if let Some(ev) = event {
            if self.dispatcher().throttle(ev) {
                return Err(Error::Throttled {
                    app: self.app_name.clone(),
                    key: keys
                        .first()
                        .map(|k| k.app_key().to_string())
                        .unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    fn bulk_failure(&self, call: Call, e: Error) -> Error {
        match e {
            Error::Timeout(inner) => Error::Timeout(format!(
                "{call} timed out for app {app}: {inner}; \
                 you can increase {app}.pool.bulk.read.timeout.ms",
                app = self.app_name,
            )),
            other => other,
        }
    }
}
