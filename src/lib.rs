//! # proxy-rotation-pool
//!
//! A shared proxy pool for fleets of worker processes: a fast ephemeral
//! cache (redis) mirrors a durable store (postgres), rotation queues hand
//! out per-destination proxy standings round-robin, and a write-back sync
//! reconciles cache-only records into durable rows.
//!
//! The cache bootstraps itself from the durable store on cold start —
//! exactly one process wins an advisory lock and populates it while the
//! rest wait — and `sync_to_db` later persists everything minted or mutated
//! in the cache, then resets it.

pub mod backend;
pub mod cache;
pub mod config;
pub mod durable;
pub mod error;
pub mod manager;
pub mod model;
pub mod retry;
pub mod rotation;
mod utils;

pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use cache::CacheStore;
pub use config::{PoolConfig, PoolConfigBuilder};
pub use durable::{DurableStore, MemoryDurableStore, PgDurableStore};
pub use error::PoolError;
pub use manager::PoolManager;
pub use model::{Detail, Protocol, Proxy, Queue};
pub use retry::RetryPolicy;
pub use rotation::RotationQueue;
