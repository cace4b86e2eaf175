//! Durable store abstraction: the canonical, persistent record keeper and
//! sole source of permanent identity.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::model::{Detail, Proxy, Queue};

pub use memory::MemoryDurableStore;
pub use postgres::PgDurableStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a proxy, returning its assigned durable id. Fails with
    /// [`PoolError::DuplicateEntity`] if `(address, port)` already exists.
    async fn insert_proxy(&self, proxy: &Proxy) -> Result<i64, PoolError>;

    /// Insert a queue, honoring a preset durable id (reserved queues).
    async fn insert_queue(&self, queue: &Queue) -> Result<i64, PoolError>;

    /// Insert a detail; requires durable proxy and queue ids.
    async fn insert_detail(&self, detail: &Detail) -> Result<i64, PoolError>;

    /// Update a detail by durable id, or by its `(queue, proxy)` pair when
    /// no detail id is known yet. Fails if neither is resolvable.
    async fn update_detail(&self, detail: &Detail) -> Result<(), PoolError>;

    async fn get_queues(&self) -> Result<Vec<Queue>, PoolError>;
    async fn get_proxies(&self) -> Result<Vec<Proxy>, PoolError>;
    async fn get_detail_by_queue_and_proxy(
        &self,
        queue_id: i64,
        proxy_id: i64,
    ) -> Result<Option<Detail>, PoolError>;
    async fn get_proxy_by_address_and_port(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Option<Proxy>, PoolError>;

    /// Create the reserved seed/aggregate queue rows if absent, validate
    /// existing rows against the configured ids and sentinel domains, and
    /// resequence the id generator past the current maximum.
    async fn init_seed_queues(&self, config: &PoolConfig) -> Result<(), PoolError>;

    /// Ensure every known proxy has a seed-queue detail, then resequence
    /// the detail id generator.
    async fn init_seed_details(&self, config: &PoolConfig) -> Result<(), PoolError>;

    /// Least-recently-used eligible seed details, active then inactive, each
    /// subset capped and filtered to `last_used` older than the reuse
    /// interval. Runs `init_seed_details` first.
    async fn get_seed_details(&self, config: &PoolConfig) -> Result<Vec<Detail>, PoolError>;

    /// The non-seed analogue of `get_seed_details`, capped by the per-queue
    /// active/inactive limits.
    async fn get_queue_details(
        &self,
        queue_id: i64,
        config: &PoolConfig,
    ) -> Result<Vec<Detail>, PoolError>;
}
