//! Write orchestration: fan-out stores, deletes, touches and counters.
//!
//! Every write goes to all write replicas. The caller gets a latch back
//! immediately; replica tasks complete it as they finish. Write-only
//! replicas receive the write but are not counted against the latch's
//! success denominator.

use super::CacheClient;
use crate::error::{Error, Result};
use crate::event::{Call, CacheEvent};
use crate::key::CacheKey;
use crate::latch::{Policy, WriteLatch};
use crate::metrics::{RESULT_ERROR, RESULT_SUCCESS, RESULT_TIMEOUT};
use crate::pool::Replica;
use crate::value::{CachedData, Transcoder};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-replica write operation, carrying its encoded payload where one
/// applies.
enum WriteOp {
    Set(CachedData),
    Add(CachedData),
    Replace(CachedData),
    Append(CachedData),
    AppendOrAdd(CachedData),
    Delete,
    Touch,
}

async fn run_write(replica: &dyn Replica, op: &WriteOp, key: &str, ttl: u64) -> Result<bool> {
    match op {
        WriteOp::Set(data) => replica.set(key, data, ttl).await,
        WriteOp::Add(data) => replica.add(key, data, ttl).await,
        WriteOp::Replace(data) => replica.replace(key, data, ttl).await,
        WriteOp::Append(data) => replica.append(key, data).await,
        WriteOp::AppendOrAdd(data) => replica.append_or_add(key, data, ttl).await,
        WriteOp::Delete => replica.delete(key).await,
        WriteOp::Touch => replica.touch(key, ttl).await,
    }
}

fn store_op(call: Call, data: CachedData) -> WriteOp {
    match call {
        Call::Add => WriteOp::Add(data),
        Call::Replace => WriteOp::Replace(data),
        Call::Append => WriteOp::Append(data),
        Call::AppendOrAdd => WriteOp::AppendOrAdd(data),
        _ => WriteOp::Set(data),
    }
}

impl CacheClient {
    /// Store a value on every write replica.
    ///
    /// `ttl` defaults to the client's default TTL; `policy` defaults to
    /// all-minus-one.
    pub async fn set<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.store(Call::Set, key, value, tc, ttl, policy).await
    }

    /// Store a value only where the key does not already exist.
    pub async fn add<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.store(Call::Add, key, value, tc, ttl, policy).await
    }

    /// Add a value and wait for every counted replica to accept it.
    pub async fn try_add<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
    ) -> Result<bool> {
        let latch = self.add(key, value, tc, ttl, Some(Policy::None)).await?;
        let timeout = self
            .pool()
            .map(|p| p.operation_timeout())
            .unwrap_or(Duration::from_millis(2500));
        let (succeeded, failed) = latch.await_all(timeout).await;
        Ok(latch.total_replicas() > 0 && failed == 0 && succeeded == latch.total_replicas())
    }

    /// Replace a value only where the key already exists.
    pub async fn replace<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.store(Call::Replace, key, value, tc, ttl, policy).await
    }

    /// Append to an existing value, then refresh its TTL everywhere.
    pub async fn append<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.store(Call::Append, key, value, tc, ttl, policy).await
    }

    /// Append where the key exists, add where it does not.
    pub async fn append_or_add<T>(
        &self,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.store(Call::AppendOrAdd, key, value, tc, ttl, policy).await
    }

    /// Delete a key from every write replica.
    pub async fn delete(&self, key: &str, policy: Option<Policy>) -> Result<Arc<WriteLatch>> {
        self.simple_fanout(Call::Delete, key, 0, policy).await
    }

    /// Refresh a key's TTL on every write replica.
    pub async fn touch(
        &self,
        key: &str,
        ttl: u64,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        self.simple_fanout(Call::Touch, key, ttl, policy).await
    }

    /// Increment a counter on every write replica and converge them on the
    /// maximum observed value. Returns the converged value, or `None` when
    /// no replica could apply the mutation.
    pub async fn incr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>> {
        self.counter_op(Call::Incr, key, by, default, ttl).await
    }

    /// Decrement a counter on every write replica and converge them on the
    /// maximum observed value.
    pub async fn decr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>> {
        self.counter_op(Call::Decr, key, by, default, ttl).await
    }

    /// Shared path for the value-carrying store operations.
    async fn store<T>(
        &self,
        call: Call,
        key: &str,
        value: &T,
        tc: &dyn Transcoder<T>,
        ttl: Option<u64>,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let policy = self.effective_policy(policy);
        self.check_ttl(ttl, call)?;

        let throw = self.do_throw();
        let Some(pool) = self.pool() else {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) };
        };
        let (writers, counted) = self.write_set(pool.as_ref());
        if writers.is_empty() {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) };
        }

        let ck = self.cache_key(key)?;
        let event = match self.open_event(call, std::slice::from_ref(&ck), Some(ttl)) {
            Ok(event) => event,
            Err(e) => return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) },
        };

        let start = Instant::now();
        let encoded = match tc.encode(value) {
            Ok(data) => data,
            Err(e) => return self.write_failure(call, &ck, e, &event, policy, start),
        };

        let latch = WriteLatch::new(policy, counted);
        let write_only = pool.write_only_replicas();
        // Sealed envelopes differ per key form, so cache one per flavour.
        let mut sealed: [Option<CachedData>; 2] = [None, None];

        for replica in &writers {
            let duet = replica.is_duet();
            let wire_value = if ck.hashed().is_some() {
                match self.seal_for(&ck, duet, &encoded, ttl, &mut sealed) {
                    Ok(data) => data,
                    Err(e) => return self.write_failure(call, &ck, e, &event, policy, start),
                }
            } else {
                encoded.clone()
            };
            self.spawn_write(
                replica,
                store_op(call, wire_value),
                ck.derived(duet).to_string(),
                ttl,
                Self::is_counted(replica, &write_only).then(|| Arc::clone(&latch)),
            );
        }

        // Append leaves the stored TTL untouched on the backend, so refresh
        // every copy explicitly.
        if call == Call::Append {
            if let Err(e) = self.touch_replicas(&ck, ttl).await {
                return self.write_failure(call, &ck, e, &event, policy, start);
            }
        }

        if let Some(ev) = &event {
            ev.set_payload(encoded);
            self.close_write_event(ev, &latch, pool.operation_timeout());
        }

        self.metrics.ttl_summary(call).record(ttl);
        self.metrics
            .operation_timer(call, None, RESULT_SUCCESS, 1, None, self.max_write_ms())
            .record(start.elapsed());
        Ok(latch)
    }

    /// Shared path for delete and touch, which carry no payload.
    async fn simple_fanout(
        &self,
        call: Call,
        key: &str,
        ttl: u64,
        policy: Option<Policy>,
    ) -> Result<Arc<WriteLatch>> {
        let policy = self.effective_policy(policy);
        if call == Call::Touch {
            self.check_ttl(ttl, call)?;
        }

        let throw = self.do_throw();
        let Some(pool) = self.pool() else {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) };
        };
        let (writers, counted) = self.write_set(pool.as_ref());
        if writers.is_empty() {
            let e = self.no_replica(call);
            return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) };
        }

        let ck = self.cache_key(key)?;
        let ttl_attr = (call == Call::Touch).then_some(ttl);
        let event = match self.open_event(call, std::slice::from_ref(&ck), ttl_attr) {
            Ok(event) => event,
            Err(e) => return if throw { Err(e) } else { Ok(WriteLatch::zero(policy)) },
        };

        let start = Instant::now();
        let latch = WriteLatch::new(policy, counted);
        let write_only = pool.write_only_replicas();

        for replica in &writers {
            let op = if call == Call::Touch {
                WriteOp::Touch
            } else {
                WriteOp::Delete
            };
            self.spawn_write(
                replica,
                op,
                ck.derived(replica.is_duet()).to_string(),
                ttl,
                Self::is_counted(replica, &write_only).then(|| Arc::clone(&latch)),
            );
        }

        if let Some(ev) = &event {
            self.close_write_event(ev, &latch, pool.operation_timeout());
        }

        if call == Call::Touch {
            self.metrics.ttl_summary(call).record(ttl);
        }
        self.metrics
            .operation_timer(call, None, RESULT_SUCCESS, 1, None, self.max_write_ms())
            .record(start.elapsed());
        Ok(latch)
    }

    /// Incr/decr fan-out with cross-replica convergence on the maximum.
    async fn counter_op(
        &self,
        call: Call,
        key: &str,
        by: u64,
        default: u64,
        ttl: u64,
    ) -> Result<Option<u64>> {
        self.check_ttl(ttl, call)?;
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

        let ck = self.cache_key(key)?;
        let event = match self.open_event(call, std::slice::from_ref(&ck), Some(ttl)) {
            Ok(event) => event,
            Err(e) => return if throw { Err(e) } else { Ok(None) },
        };

        let start = Instant::now();
        let attempt = self.converge_counter(call, &ck, &writers, by, default, ttl).await;

        let (result, status) = match attempt {
            Ok(current) => {
                if let Some(ev) = &event {
                    self.dispatcher().complete(ev);
                }
                (Ok(current), RESULT_SUCCESS)
            }
            Err(e) => {
                let status = if e.is_timeout() {
                    RESULT_TIMEOUT
                } else {
                    RESULT_ERROR
                };
                if let Some(ev) = &event {
                    ev.set_status(status);
                    self.dispatcher().error(ev, &e);
                }
                let result = if throw { Err(e) } else { Ok(None) };
                (result, status)
            }
        };

        self.metrics.ttl_summary(call).record(ttl);
        self.metrics
            .operation_timer(call, None, status, 1, None, self.max_write_ms())
            .record(start.elapsed());
        result
    }

    async fn converge_counter(
        &self,
        call: Call,
        ck: &CacheKey,
        writers: &[Arc<dyn Replica>],
        by: u64,
        default: u64,
        ttl: u64,
    ) -> Result<Option<u64>> {
        let mut values = Vec::with_capacity(writers.len());
        for replica in writers {
            let wire_key = ck.derived(replica.is_duet());
            let value = match call {
                Call::Decr => replica.decr(wire_key, by, default, ttl).await?,
                _ => replica.incr(wire_key, by, default, ttl).await?,
            };
            values.push(value);
        }

        let Some(current) = values.iter().flatten().copied().max() else {
            return Ok(None);
        };

        // Best-effort repair: replicas that missed the key are initialised
        // to the converged value, divergent ones are overwritten.
        for (replica, value) in writers.iter().zip(&values) {
            let wire_key = ck.derived(replica.is_duet());
            let outcome = match value {
                None => {
                    debug!(
                        app = %self.app_name,
                        key = %ck,
                        group = %replica.server_group(),
                        current,
                        "re-initialising missing counter"
                    );
                    let repair = match call {
                        Call::Decr => replica.decr(wire_key, 0, current, ttl).await,
                        _ => replica.incr(wire_key, 0, current, ttl).await,
                    };
                    repair.map(|_| true)
                }
                Some(v) if *v != current => {
                    debug!(
                        app = %self.app_name,
                        key = %ck,
                        group = %replica.server_group(),
                        observed = *v,
                        current,
                        "overwriting divergent counter"
                    );
                    let data = CachedData::new(0, Bytes::from(current.to_string()));
                    replica.set(wire_key, &data, ttl).await
                }
                _ => Ok(true),
            };
            if let Err(e) = outcome {
                debug!(
                    app = %self.app_name,
                    key = %ck,
                    group = %replica.server_group(),
                    error = %e,
                    "counter repair failed"
                );
            }
        }
        Ok(Some(current))
    }

    /// Dispatch one replica write on its own task, reporting into the latch
    /// when this replica counts toward the policy.
    fn spawn_write(
        &self,
        replica: &Arc<dyn Replica>,
        op: WriteOp,
        wire_key: String,
        ttl: u64,
        latch: Option<Arc<WriteLatch>>,
    ) {
        let replica = Arc::clone(replica);
        let app = self.app_name.clone();
        tokio::spawn(async move {
            let outcome = run_write(replica.as_ref(), &op, &wire_key, ttl).await;
            if let Err(e) = &outcome {
                debug!(
                    app = %app,
                    key = %wire_key,
                    group = %replica.server_group(),
                    error = %e,
                    "replica write failed"
                );
            }
            if let Some(latch) = latch {
                latch.complete(matches!(outcome, Ok(true)));
            }
        });
    }

    /// Terminate the write event now, or hand it to the latch when events
    /// run in latch mode.
    fn close_write_event(&self, event: &Arc<CacheEvent>, latch: &Arc<WriteLatch>, deadline: Duration) {
        if self.events_using_latch() {
            latch.attach_event(Arc::clone(event), self.dispatcher().clone());
            latch.schedule_validation(deadline);
        } else {
            self.dispatcher().complete(event);
        }
    }

    fn write_failure(
        &self,
        call: Call,
        ck: &CacheKey,
        e: Error,
        event: &Option<Arc<CacheEvent>>,
        policy: Policy,
        start: Instant,
    ) -> Result<Arc<WriteLatch>> {
        let status = if e.is_timeout() {
            RESULT_TIMEOUT
        } else {
            RESULT_ERROR
        };
        if let Some(ev) = event {
            ev.set_status(status);
            self.dispatcher().error(ev, &e);
        }
        self.metrics
            .operation_timer(call, None, status, 1, None, self.max_write_ms())
            .record(start.elapsed());
        debug!(app = %self.app_name, key = %ck, call = %call, error = %e, "write failed");
        if self.do_throw() {
            Err(e)
        } else {
            Ok(WriteLatch::zero(policy))
        }
    }

    /// Seal the encoded payload for one key flavour, caching per flavour so
    /// the value is encoded at most twice per fan-out.
    fn seal_for(
        &self,
        ck: &CacheKey,
        duet: bool,
        encoded: &CachedData,
        ttl: u64,
        sealed: &mut [Option<CachedData>; 2],
    ) -> Result<CachedData> {
        let slot = &mut sealed[duet as usize];
        if let Some(data) = slot {
            return Ok(data.clone());
        }
        let data = self.envelope().seal(ck.canonical(duet), encoded, ttl)?;
        *slot = Some(data.clone());
        Ok(data)
    }
}
