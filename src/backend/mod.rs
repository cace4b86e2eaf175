//! Ephemeral store abstraction behind the cache tier.
//!
//! The cache needs a small set of primitives from its networked store:
//! atomic counters for temporary-id minting, per-record field maps, set
//! membership for the changed/new tracking sets, ordered lists for the
//! rotation queues, pattern-based key enumeration and an advisory lock with
//! a single non-blocking acquisition attempt.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PoolError;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, PoolError>;

    /// Keys matching a `*`-glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PoolError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PoolError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), PoolError>;
    async fn del(&self, key: &str) -> Result<(), PoolError>;

    /// Increment an integer key, creating it at 0 first if absent.
    async fn incr(&self, key: &str) -> Result<i64, PoolError>;

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>)
        -> Result<(), PoolError>;
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, PoolError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), PoolError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, PoolError>;
    /// Members of `key` not present in `other`.
    async fn sdiff(&self, key: &str, other: &str) -> Result<Vec<String>, PoolError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<(), PoolError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, PoolError>;
    async fn llen(&self, key: &str) -> Result<usize, PoolError>;

    /// Drop every key in the store.
    async fn flush_all(&self) -> Result<(), PoolError>;

    /// One non-blocking attempt at the named advisory lock. The lock key
    /// stays visible to every process until released or expired.
    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool, PoolError>;
    async fn unlock(&self, name: &str) -> Result<(), PoolError>;
}
