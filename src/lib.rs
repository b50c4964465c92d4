//! Zone-aware, multi-replica ephemeral cache client.
//!
//! This crate provides the client-side orchestration for a fleet of
//! memcached-style cache replicas spread across failure domains (server
//! groups, typically availability zones):
//!
//! - **Read fallback**: a miss on the primary zone falls back across the
//!   other zones in pool order, stopping at the first hit
//! - **Fan-out writes**: every write goes to all write replicas behind a
//!   [`WriteLatch`] with a configurable success policy (none, one, quorum,
//!   all-minus-one, all)
//! - **Consistent reads**: read all replicas, return the value only when
//!   enough of them agree, and repair minority copies
//! - **Near cache**: optional Moka-backed in-process cache with
//!   single-flight population
//! - **Key hashing**: over-long canonical keys are replaced on the wire by
//!   a digest, with an envelope guarding against hash collisions
//! - **Live configuration**: fallback, hashing, throw behaviour and more
//!   reload from a property store on every call
//!
//! # Example
//!
//! ```rust,no_run
//! use doppio::{CacheClient, PoolManager, Policy, StringTranscoder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = PoolManager::new();
//!     // manager.register("movies", my_pool);
//!
//!     let client = CacheClient::builder("movies", manager)
//!         .prefix("cid")
//!         .default_ttl(900)
//!         .build()?;
//!
//!     let tc = StringTranscoder;
//!     let latch = client.set("user:42", &"alice".to_string(), &tc, None, None).await?;
//!     latch.await_policy(std::time::Duration::from_millis(500)).await;
//!
//!     if let Some(name) = client.get("user:42", &tc).await? {
//!         println!("found: {name}");
//!     }
//!
//!     // Quorum read with repair of stragglers.
//!     let _ = client.get_consistent("user:42", &tc, Policy::Quorum).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Application Layer               │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │               CacheClient                   │
//! │  normalise key → throttle → orchestrate     │
//! └─────────────────────────────────────────────┘
//!        │             │              │
//!        ▼             ▼              ▼
//! ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │ NearCache │  │ Replica   │  │  Metrics  │
//! │  (moka)   │  │ Pool (AZs)│  │ + Events  │
//! └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! The backend protocol codec, server discovery, health checking and
//! reconnection live behind the [`Replica`] and [`ReplicaPool`] traits and
//! are supplied by the embedding application.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod latch;
pub mod metrics;
pub mod near_cache;
pub mod pool;
pub mod testing;
pub mod value;

// Re-export main types for convenience
pub use client::{CacheClient, CacheClientBuilder};
pub use config::{Prop, Properties};
pub use error::{Error, Result};
pub use event::{Call, CallType, CacheEvent, EventBus, EventListener};
pub use key::{CacheKey, HashAlgo};
pub use latch::{Policy, WriteLatch};
pub use near_cache::{NearCache, NearEntry};
pub use pool::{ItemMetadata, MetaItem, PoolManager, Replica, ReplicaPool, ServerGroup};
pub use value::{
    BytesTranscoder, CachedData, EnvelopeTranscoder, SealedValue, StringTranscoder, Transcoder,
};

// Re-export metrics types
pub use metrics::{ClientMetrics, Counter, DistributionSummary, Timer};
