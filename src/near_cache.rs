//! Optional in-process cache in front of the remote cache.
//!
//! Backed by a Moka future cache keyed by the canonical key. Population is
//! single-flight: concurrent readers of one key share a single backend load.
//! A backend miss is cached as an explicit [`NearEntry::NotFound`] marker so
//! a hot missing key does not hammer the backend until the entry expires.

use crate::error::Result;
use crate::value::CachedData;
use moka::future::Cache;
use std::future::Future;
use std::time::Duration;

/// A near-cache entry: a loaded payload or a cached miss.
#[derive(Debug, Clone)]
pub enum NearEntry {
    Found(CachedData),
    NotFound,
}

/// In-process loading cache with single-flight population.
pub struct NearCache {
    cache: Cache<String, NearEntry>,
}

impl NearCache {
    /// Create a near cache with the given capacity and lifetimes.
    pub fn new(max_capacity: u64, ttl: Option<Duration>, tti: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        if let Some(tti) = tti {
            builder = builder.time_to_idle(tti);
        }
        Self {
            cache: builder.build(),
        }
    }

    /// Look up `key`, loading it through `load` on a miss.
    ///
    /// At most one load runs per key at a time; concurrent callers wait on
    /// the same load. Load errors are not cached.
    pub async fn get_or_load<F>(&self, key: &str, load: F) -> Result<Option<CachedData>>
    where
        F: Future<Output = Result<Option<CachedData>>>,
    {
        let entry = self
            .cache
            .try_get_with(key.to_string(), async move {
                match load.await {
                    Ok(Some(data)) => Ok(NearEntry::Found(data)),
                    Ok(None) => Ok(NearEntry::NotFound),
                    Err(e) => Err(e),
                }
            })
            .await;
        match entry {
            Ok(NearEntry::Found(data)) => Ok(Some(data)),
            Ok(NearEntry::NotFound) => Ok(None),
            Err(shared) => Err(shared.duplicate()),
        }
    }

    /// Peek without loading.
    pub async fn peek(&self, key: &str) -> Option<NearEntry> {
        self.cache.get(key).await
    }

    /// Drop one entry.
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Number of resident entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending maintenance tasks (eviction, expiry).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("entry_count", &self.entry_count())
            .finish()
    }
}
