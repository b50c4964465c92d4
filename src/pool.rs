//! Collaborator contracts: replicas, the replica pool and the pool registry.
//!
//! The client never talks to a backend directly; it orchestrates over these
//! traits. Production implementations (connection handling, protocol codec,
//! discovery, health) live outside this crate — the in-crate implementations
//! are the mocks in [`crate::testing`].

use crate::error::Result;
use crate::value::CachedData;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A replica's failure domain, typically an availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerGroup {
    pub name: String,
    pub zone: String,
}

impl ServerGroup {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
        }
    }
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Item metadata returned by the meta-debug operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    /// Seconds until the item expires, if the backend reports it.
    pub seconds_left_to_expire: Option<u64>,
    /// Seconds since the item was last accessed.
    pub seconds_since_last_access: Option<u64>,
    /// Whether the item is soft-deleted but still resident.
    pub soft_deleted: bool,
    /// Whether the item has been fetched since it was written.
    pub fetched: bool,
    /// Item size in bytes as stored.
    pub size_bytes: Option<u64>,
    /// Compare-and-swap token, if the backend exposes one.
    pub cas_token: Option<u64>,
}

/// A value plus its metadata, returned by the meta-get operation.
#[derive(Debug, Clone)]
pub struct MetaItem {
    pub data: CachedData,
    pub metadata: ItemMetadata,
}

/// One per-replica backend connection.
///
/// All operations are potentially blocking I/O. Implementations surface
/// transport faults as [`crate::Error::Connect`], queue saturation as
/// [`crate::Error::ReadQueueFull`] and deadline misses as
/// [`crate::Error::Timeout`]; the orchestrator decides what to swallow.
#[async_trait]
pub trait Replica: Send + Sync {
    /// The failure domain this replica belongs to.
    fn server_group(&self) -> &ServerGroup;

    /// Duet replicas expect the un-prefixed application key on the wire.
    fn is_duet(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<CachedData>>;

    async fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CachedData>>;

    async fn meta_get(&self, key: &str) -> Result<Option<MetaItem>>;

    async fn meta_debug(&self, key: &str) -> Result<Option<ItemMetadata>>;

    async fn set(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool>;

    async fn add(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool>;

    async fn replace(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool>;

    async fn append(&self, key: &str, value: &CachedData) -> Result<bool>;

    async fn append_or_add(&self, key: &str, value: &CachedData, ttl: u64) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool>;

    /// Increment a counter, initialising it to `default` when absent.
    /// Returns `None` when the replica could not apply the mutation.
    async fn incr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>>;

    /// Decrement a counter, initialising it to `default` when absent.
    async fn decr(&self, key: &str, by: u64, default: u64, ttl: u64) -> Result<Option<u64>>;
}

/// Supplies replicas for reads and writes along with pool-level settings.
pub trait ReplicaPool: Send + Sync {
    /// The primary read replica, usually in the caller's own zone.
    fn replica_for_read(&self) -> Option<Arc<dyn Replica>>;

    /// Ordered fallback replicas excluding the given server group.
    fn replicas_for_read_excluding(&self, group: &ServerGroup) -> Vec<Arc<dyn Replica>>;

    /// Every replica that receives writes, in stable pool order.
    fn replicas_for_write(&self) -> Vec<Arc<dyn Replica>>;

    /// Subset of the write set that only receives writes; excluded from the
    /// write-quorum denominator.
    fn write_only_replicas(&self) -> Vec<Arc<dyn Replica>>;

    fn read_timeout(&self) -> Duration;

    fn operation_timeout(&self) -> Duration;

    /// Whether this pool spans enough failure domains for zone fallback.
    fn supports_fallback(&self) -> bool;
}

/// Registry of pools by application name.
///
/// A client resolves its pool through the manager so that an alias property
/// change can repoint it at a different application's pool without a restart.
#[derive(Default)]
pub struct PoolManager {
    pools: DashMap<String, Arc<dyn ReplicaPool>>,
}

impl PoolManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, app_name: impl Into<String>, pool: Arc<dyn ReplicaPool>) {
        self.pools.insert(app_name.into(), pool);
    }

    pub fn pool_for(&self, app_name: &str) -> Option<Arc<dyn ReplicaPool>> {
        self.pools.get(app_name).map(|p| Arc::clone(p.value()))
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.len())
            .finish()
    }
}
