//! Pool manager: the facade over the cache store, durable store and
//! rotation queues.
//!
//! Constructed once with explicit backend handles and passed to whatever
//! needs it; there are no process-wide singletons.

use std::sync::Arc;

use log::{info, warn};

use crate::backend::CacheBackend;
use crate::cache::CacheStore;
use crate::config::PoolConfig;
use crate::durable::DurableStore;
use crate::error::PoolError;
use crate::model::{Detail, Protocol, Proxy, Queue};
use crate::rotation::RotationQueue;
use crate::utils::parse_domain;

pub struct PoolManager {
    cache: Arc<CacheStore>,
}

impl PoolManager {
    /// Build the manager over the given storage handles, warming the cache
    /// (which may make this process the bootstrap sync client).
    pub async fn new(
        backend: Arc<dyn CacheBackend>,
        durable: Arc<dyn DurableStore>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let cache = CacheStore::open(backend, durable, config).await?;
        Ok(Self { cache })
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    fn config(&self) -> &PoolConfig {
        self.cache.config()
    }

    /// Register a newly discovered proxy. Deduped by `(address, port)`; a
    /// fresh proxy gets a seed-queue detail marked as newly discovered.
    pub async fn new_proxy(
        &self,
        address: &str,
        port: u16,
        protocol: Protocol,
    ) -> Result<Proxy, PoolError> {
        if let Some(existing) = self
            .cache
            .get_proxy_by_address_and_port(address, port)
            .await?
        {
            info!("proxy {} already known", existing.urlify());
            return Ok(existing);
        }

        let proxy = self
            .cache
            .register_proxy(Proxy::new(address, port, protocol))
            .await?;
        info!("registered new proxy {}", proxy.urlify());

        let proxy_key = proxy
            .proxy_key
            .clone()
            .ok_or_else(|| PoolError::Backend("registered proxy has no cache key".into()))?;
        let seed_key = format!("q_{}", self.config().seed_queue_id);
        let mut detail = Detail::joining(proxy_key, seed_key);
        detail.queue_id = Some(self.config().seed_queue_id);

        let detail = self.cache.register_detail(detail).await?;
        let detail_key = detail
            .detail_key()
            .ok_or_else(|| PoolError::Backend("registered detail has no cache key".into()))?;
        self.cache.mark_detail_new(&detail_key).await?;

        Ok(proxy)
    }

    /// Create (or return) the rotation queue for a destination. The queue
    /// is identified by the destination's domain.
    pub async fn create_queue(&self, destination: &str) -> Result<Queue, PoolError> {
        let domain = parse_domain(destination);
        if let Some(existing) = self.cache.get_queue_by_domain(&domain).await? {
            warn!("queue for '{domain}' already exists");
            return Ok(existing);
        }
        info!("creating queue for '{domain}'");
        self.cache.register_queue(Queue::new(domain)).await
    }

    /// The reserved seed queue.
    pub async fn seed_queue(&self) -> Result<Queue, PoolError> {
        self.cache
            .get_queue_by_id(self.config().seed_queue_id)
            .await?
            .ok_or_else(|| PoolError::Backend("seed queue not present in cache".into()))
    }

    /// A handle on one side of a queue's rotation.
    pub fn rotation(&self, queue: &Queue, active: bool) -> Result<RotationQueue, PoolError> {
        let queue_key = queue.queue_key.clone().ok_or_else(|| {
            PoolError::RotationQueueInvalid("queue has no cache key".into())
        })?;
        Ok(RotationQueue::new(Arc::clone(&self.cache), queue_key, active))
    }

    /// Give a seed-queue detail's proxy standing in another queue. Deduped
    /// by `(queue, proxy)`; when both sides already have durable ids the
    /// durable store is consulted first, in case a prior sync persisted the
    /// pairing the cache no longer holds.
    pub async fn clone_detail(
        &self,
        detail: &Detail,
        target_queue: &Queue,
    ) -> Result<Detail, PoolError> {
        if detail.queue_id != Some(self.config().seed_queue_id) {
            return Err(PoolError::RotationQueueInvalid(
                "only seed-queue details can be cloned".into(),
            ));
        }
        let target_key = target_queue.queue_key.clone().ok_or_else(|| {
            PoolError::RotationQueueInvalid("target queue has no cache key".into())
        })?;
        if !self.cache.queue_exists(&target_key).await? {
            return Err(PoolError::RotationQueueInvalid(format!(
                "unknown target queue '{target_key}'"
            )));
        }
        let proxy_key = detail.proxy_key.clone().ok_or_else(|| {
            PoolError::RotationQueueInvalid("detail references no proxy".into())
        })?;

        let pairing_key = format!("d_{target_key}_{proxy_key}");
        if let Some(existing) = self.cache.get_detail(&pairing_key).await? {
            warn!("detail already cloned into '{target_key}'");
            return Ok(existing);
        }

        if let (Some(queue_id), Some(proxy_id)) = (target_queue.queue_id, detail.proxy_id) {
            if let Some(mut persisted) = self
                .cache
                .durable()
                .get_detail_by_queue_and_proxy(queue_id, proxy_id)
                .await?
            {
                info!("pairing already persisted, pulling detail from the durable store");
                persisted.queue_key = Some(target_key);
                persisted.proxy_key = Some(proxy_key);
                return self.cache.register_detail(persisted).await;
            }
        }

        let mut cloned = Detail::joining(proxy_key, target_key);
        cloned.proxy_id = detail.proxy_id;
        cloned.queue_id = target_queue.queue_id;
        let cloned_key = cloned
            .detail_key()
            .ok_or_else(|| PoolError::Backend("cloned detail has no cache key".into()))?;
        self.cache.mark_detail_new(&cloned_key).await?;
        self.cache.register_detail(cloned).await
    }

    /// Pull a queue's eligible durable details into the cache and rebuild
    /// both of its rotation sides.
    pub async fn warm_queue(&self, queue: &Queue) -> Result<(), PoolError> {
        if let Some(queue_id) = queue.queue_id {
            let details = self
                .cache
                .durable()
                .get_queue_details(queue_id, self.config())
                .await?;
            info!("warming queue '{}' with {} details", queue.domain, details.len());
            for detail in details {
                self.cache.register_detail(detail).await?;
            }
        }
        self.rotation(queue, true)?.reload().await?;
        self.rotation(queue, false)?.reload().await
    }

    /// Write the cache back to the durable store and discard it. Callers
    /// must ensure no concurrent mutators run during this window.
    pub async fn sync_to_db(&self) -> Result<(), PoolError> {
        self.cache.sync_to_db().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::durable::MemoryDurableStore;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig::builder()
            .sync_poll_interval(Duration::from_millis(10))
            .connect_attempts(2)
            .connect_interval(Duration::from_millis(1))
            .build()
    }

    async fn open_manager(durable: &Arc<MemoryDurableStore>) -> PoolManager {
        PoolManager::new(
            Arc::new(MemoryBackend::new()) as Arc<dyn CacheBackend>,
            Arc::clone(durable) as Arc<dyn DurableStore>,
            test_config(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn new_proxy_dedupes_by_address_and_port() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        let first = manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        let again = manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        assert_eq!(again.proxy_key, first.proxy_key);

        // One proxy, one seed-queue detail.
        let seed = manager.seed_queue().await.unwrap();
        let details = manager
            .cache()
            .get_all_queue_details(seed.queue_key.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].queue_id, Some(manager.config().seed_queue_id));
    }

    #[tokio::test]
    async fn create_queue_dedupes_by_domain() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        let first = manager.create_queue("https://example.com/a?x=1").await.unwrap();
        let again = manager.create_queue("example.com").await.unwrap();
        assert_eq!(first.domain, "example.com");
        assert_eq!(again.queue_key, first.queue_key);
    }

    #[tokio::test]
    async fn clone_detail_is_idempotent_per_target() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        let queue = manager.create_queue("example.com").await.unwrap();

        let seed = manager.seed_queue().await.unwrap();
        let seed_rotation = manager.rotation(&seed, false).unwrap();
        seed_rotation.reload().await.unwrap();
        let seed_detail = seed_rotation.dequeue(true).await.unwrap();

        let cloned = manager.clone_detail(&seed_detail, &queue).await.unwrap();
        let again = manager.clone_detail(&seed_detail, &queue).await.unwrap();
        assert_eq!(again.detail_key(), cloned.detail_key());
        assert_eq!(cloned.queue_key, queue.queue_key);
    }

    #[tokio::test]
    async fn clone_of_non_seed_detail_is_fatal() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        let a = manager.create_queue("a.example").await.unwrap();
        let b = manager.create_queue("b.example").await.unwrap();

        let seed = manager.seed_queue().await.unwrap();
        let rotation = manager.rotation(&seed, false).unwrap();
        rotation.reload().await.unwrap();
        let seed_detail = rotation.dequeue(true).await.unwrap();

        let cloned = manager.clone_detail(&seed_detail, &a).await.unwrap();
        assert!(matches!(
            manager.clone_detail(&cloned, &b).await,
            Err(PoolError::RotationQueueInvalid(_))
        ));
    }

    #[tokio::test]
    async fn sync_persists_discoveries_and_is_idempotent() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        manager.new_proxy("2.2.2.2", 80, Protocol::Https).await.unwrap();
        manager.create_queue("example.com").await.unwrap();

        manager.sync_to_db().await.unwrap();
        assert_eq!(durable.proxy_count(), 2);
        assert_eq!(durable.detail_count(), 2);
        // Reserved queues plus the created one.
        assert_eq!(durable.queue_count(), 3);

        manager.sync_to_db().await.unwrap();
        assert_eq!(durable.proxy_count(), 2);
        assert_eq!(durable.detail_count(), 2);
        assert_eq!(durable.queue_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_discovery_across_processes_is_discarded_at_sync() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager_a = open_manager(&durable).await;
        let manager_b = open_manager(&durable).await;

        // Both fleets discover the same endpoint before either syncs.
        manager_a.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        manager_b.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();

        manager_a.sync_to_db().await.unwrap();
        manager_b.sync_to_db().await.unwrap();

        assert_eq!(durable.proxy_count(), 1);
        assert_eq!(durable.detail_count(), 1);
    }

    #[tokio::test]
    async fn changed_detail_reaches_the_durable_store() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        manager.sync_to_db().await.unwrap();
        manager.cache().warm().await.unwrap();

        let seed = manager.seed_queue().await.unwrap();
        let rotation = manager.rotation(&seed, false).unwrap();
        let mut detail = rotation.dequeue(true).await.unwrap();
        assert_eq!(detail.detail_id, Some(1));

        detail.bad_count = 7;
        manager.cache().update_detail(&detail).await.unwrap();
        manager.sync_to_db().await.unwrap();

        let persisted = durable
            .get_detail_by_queue_and_proxy(detail.queue_id.unwrap(), detail.proxy_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.bad_count, 7);
    }

    #[tokio::test]
    async fn clone_pulls_persisted_pairing_from_the_durable_store() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        let queue = manager.create_queue("example.com").await.unwrap();
        let seed = manager.seed_queue().await.unwrap();
        let rotation = manager.rotation(&seed, false).unwrap();
        rotation.reload().await.unwrap();
        let seed_detail = rotation.dequeue(true).await.unwrap();
        manager.clone_detail(&seed_detail, &queue).await.unwrap();

        manager.sync_to_db().await.unwrap();
        manager.cache().warm().await.unwrap();

        // Post-sync everything carries durable ids.
        let queue = manager.create_queue("example.com").await.unwrap();
        assert!(queue.queue_id.is_some());
        let rotation = manager.rotation(&manager.seed_queue().await.unwrap(), false).unwrap();
        let seed_detail = rotation.dequeue(true).await.unwrap();

        let cloned = manager.clone_detail(&seed_detail, &queue).await.unwrap();
        assert!(cloned.detail_id.is_some());
    }

    #[tokio::test]
    async fn warm_queue_loads_durable_details_into_rotation() {
        let durable = Arc::new(MemoryDurableStore::new());
        let manager = open_manager(&durable).await;

        manager.new_proxy("1.1.1.1", 80, Protocol::Http).await.unwrap();
        let queue = manager.create_queue("example.com").await.unwrap();
        let seed = manager.seed_queue().await.unwrap();
        let rotation = manager.rotation(&seed, false).unwrap();
        rotation.reload().await.unwrap();
        let seed_detail = rotation.dequeue(true).await.unwrap();
        manager.clone_detail(&seed_detail, &queue).await.unwrap();

        manager.sync_to_db().await.unwrap();
        manager.cache().warm().await.unwrap();

        let queue = manager.create_queue("example.com").await.unwrap();
        manager.warm_queue(&queue).await.unwrap();
        assert_eq!(
            manager.rotation(&queue, false).unwrap().length().await.unwrap(),
            1
        );
    }
}
