//! Cache store: the fast-path mirror of the durable store, plus the
//! cold-start bootstrap and write-back synchronization protocols.
//!
//! State machine: COLD (no cache contents), SYNCING (exactly one process,
//! the sync client, populates the cache while everyone else poll-waits on
//! the shared flag) and WARM (normal operation). The advisory lock key is
//! itself the syncing flag: while it exists, every cache operation from a
//! non-sync-client blocks by polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::backend::CacheBackend;
use crate::config::PoolConfig;
use crate::durable::DurableStore;
use crate::error::PoolError;
use crate::model::{Detail, Proxy, Queue};
use crate::rotation::RotationQueue;

/// Advisory lock key; doubles as the shared syncing flag.
const SYNC_FLAG_KEY: &str = "syncing";
/// Set of detail keys mutated since the last write-back.
const CHANGED_DETAILS_KEY: &str = "changed_details";
/// Set of detail keys created in the cache since the last write-back.
const NEW_DETAILS_KEY: &str = "new_details";
/// Prefix for the per-kind temporary id counters.
const TEMP_ID_COUNTER: &str = "temp_id_counter";

/// The durable id encoded in a durable-form cache key (`q_5`, `p_12`).
/// Temp-form keys (`qt_3`, `pt_7`) yield `None`.
fn key_durable_id(key: &str) -> Option<i64> {
    let (prefix, rest) = key.split_once('_')?;
    match prefix {
        "q" | "p" => rest.parse().ok(),
        _ => None,
    }
}

/// Ephemeral projection of the durable store. Every record it holds without
/// a durable id carries a cache-minted temporary id until a write-back sync
/// resolves it.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    durable: Arc<dyn DurableStore>,
    config: PoolConfig,
    sync_client: AtomicBool,
}

impl CacheStore {
    /// Build the store and bring the cache to WARM: bootstrap it from the
    /// durable store if it is cold, or wait for whichever process won the
    /// bootstrap race.
    pub async fn open(
        backend: Arc<dyn CacheBackend>,
        durable: Arc<dyn DurableStore>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let store = Arc::new(Self {
            backend,
            durable,
            config,
            sync_client: AtomicBool::new(false),
        });
        store.warm().await?;
        Ok(store)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    fn is_sync_client(&self) -> bool {
        self.sync_client.load(Ordering::SeqCst)
    }

    async fn is_syncing(&self) -> Result<bool, PoolError> {
        self.backend.exists(SYNC_FLAG_KEY).await
    }

    /// Block (by polling the shared flag) while another process populates
    /// the cache. The sync client's own writes pass through.
    async fn await_ready(&self) -> Result<(), PoolError> {
        while self.is_syncing().await? && !self.is_sync_client() {
            info!("awaiting cache sync...");
            sleep(self.config.sync_poll_interval).await;
        }
        Ok(())
    }

    /// COLD -> SYNCING -> WARM. Safe to call when already warm.
    pub async fn warm(self: &Arc<Self>) -> Result<(), PoolError> {
        if !self.backend.keys("*").await?.is_empty() {
            self.await_ready().await?;
            return Ok(());
        }

        if self.backend.try_lock(SYNC_FLAG_KEY, self.config.sync_lock_ttl).await? {
            self.sync_client.store(true, Ordering::SeqCst);
            let result = self.bootstrap().await;
            self.backend.unlock(SYNC_FLAG_KEY).await?;
            self.sync_client.store(false, Ordering::SeqCst);
            result
        } else {
            // Lost the race; the winner is filling the cache.
            self.await_ready().await
        }
    }

    /// Populate the cache from the durable store and rebuild the seed
    /// rotation queues. Runs only in the sync client.
    async fn bootstrap(self: &Arc<Self>) -> Result<(), PoolError> {
        info!("syncing proxy data from the durable store into the cache...");
        for kind in ["q", "p"] {
            self.backend
                .set(&format!("{TEMP_ID_COUNTER}_{kind}"), "0")
                .await?;
        }

        self.durable.init_seed_queues(&self.config).await?;

        let queues = self.durable.get_queues().await?;
        info!("loaded {} queues from the durable store", queues.len());
        for queue in queues {
            self.register_queue(queue).await?;
        }

        let proxies = self.durable.get_proxies().await?;
        info!("loaded {} proxies from the durable store", proxies.len());
        for proxy in proxies {
            self.register_proxy(proxy).await?;
        }

        let seed_details = self.durable.get_seed_details(&self.config).await?;
        info!("loaded {} seed details from the durable store", seed_details.len());
        for detail in seed_details {
            self.register_detail(detail).await?;
        }

        let seed_queue = self
            .get_queue_by_id(self.config.seed_queue_id)
            .await?
            .ok_or_else(|| PoolError::Backend("seed queue missing after bootstrap".into()))?;
        let seed_key = seed_queue
            .queue_key
            .ok_or_else(|| PoolError::Backend("seed queue has no cache key".into()))?;

        RotationQueue::new(Arc::clone(self), &seed_key, true).reload().await?;
        RotationQueue::new(Arc::clone(self), &seed_key, false).reload().await?;

        info!("cache sync complete");
        Ok(())
    }

    /// Mint the cache key for an entity: its durable id when it has one,
    /// otherwise a fresh temporary id from the per-kind counter.
    async fn mint_key(&self, kind: &str, durable_id: Option<i64>) -> Result<String, PoolError> {
        match durable_id {
            Some(id) => Ok(format!("{kind}_{id}")),
            None => {
                let n = self
                    .backend
                    .incr(&format!("{TEMP_ID_COUNTER}_{kind}"))
                    .await?;
                Ok(format!("{kind}t_{n}"))
            }
        }
    }

    /// Store a queue and return it re-read from the cache.
    pub async fn register_queue(&self, mut queue: Queue) -> Result<Queue, PoolError> {
        self.await_ready().await?;
        let key = match queue.queue_key.take() {
            Some(key) => key,
            None => self.mint_key("q", queue.queue_id).await?,
        };
        queue.queue_key = Some(key.clone());
        self.backend.hset_all(&key, &queue.to_fields()).await?;
        Queue::from_fields(&self.backend.hget_all(&key).await?)
    }

    /// Store a proxy and return it re-read from the cache.
    pub async fn register_proxy(&self, mut proxy: Proxy) -> Result<Proxy, PoolError> {
        self.await_ready().await?;
        let key = match proxy.proxy_key.take() {
            Some(key) => key,
            None => self.mint_key("p", proxy.proxy_id).await?,
        };
        proxy.proxy_key = Some(key.clone());
        self.backend.hset_all(&key, &proxy.to_fields()).await?;
        Proxy::from_fields(&self.backend.hget_all(&key).await?)
    }

    /// Store a detail and return it re-read from the cache. Requires both
    /// referenced records to be present; idempotent for an existing
    /// `(proxy, queue)` pairing.
    pub async fn register_detail(&self, mut detail: Detail) -> Result<Detail, PoolError> {
        self.await_ready().await?;

        // Durable-loaded details reference by id only; derive their keys.
        if detail.proxy_key.is_none() {
            detail.proxy_key = detail.proxy_id.map(|id| format!("p_{id}"));
        }
        if detail.queue_key.is_none() {
            detail.queue_key = detail.queue_id.map(|id| format!("q_{id}"));
        }

        let (proxy_key, queue_key) = match (&detail.proxy_key, &detail.queue_key) {
            (Some(p), Some(q)) => (p.clone(), q.clone()),
            _ => {
                return Err(PoolError::RotationQueueInvalid(
                    "detail must reference a proxy and a queue".into(),
                ))
            }
        };

        // And the converse: durable-form keys imply the durable ids, which
        // write-back relies on.
        if detail.proxy_id.is_none() {
            detail.proxy_id = key_durable_id(&proxy_key);
        }
        if detail.queue_id.is_none() {
            detail.queue_id = key_durable_id(&queue_key);
        }
        if !self.backend.exists(&proxy_key).await? || !self.backend.exists(&queue_key).await? {
            return Err(PoolError::RotationQueueInvalid(format!(
                "cache holds no proxy '{proxy_key}' or queue '{queue_key}' for detail"
            )));
        }

        let detail_key = format!("d_{queue_key}_{proxy_key}");
        if self.backend.exists(&detail_key).await? {
            debug!("detail {detail_key} already registered");
            return Detail::from_fields(&self.backend.hget_all(&detail_key).await?);
        }

        self.backend.hset_all(&detail_key, &detail.to_fields()).await?;
        Detail::from_fields(&self.backend.hget_all(&detail_key).await?)
    }

    /// Rewrite a detail's record and mark it changed for the next
    /// write-back.
    pub async fn update_detail(&self, detail: &Detail) -> Result<(), PoolError> {
        self.await_ready().await?;
        let detail_key = detail.detail_key().ok_or_else(|| {
            PoolError::RotationQueueInvalid("detail has no cache key to update".into())
        })?;
        self.backend.hset_all(&detail_key, &detail.to_fields()).await?;
        self.backend.sadd(CHANGED_DETAILS_KEY, &detail_key).await
    }

    /// Mark a detail as newly discovered so write-back inserts it even if
    /// both its references carry durable ids.
    pub async fn mark_detail_new(&self, detail_key: &str) -> Result<(), PoolError> {
        self.backend.sadd(NEW_DETAILS_KEY, detail_key).await
    }

    pub async fn get_detail(&self, detail_key: &str) -> Result<Option<Detail>, PoolError> {
        self.await_ready().await?;
        let fields = self.backend.hget_all(detail_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Detail::from_fields(&fields).map(Some)
    }

    pub async fn get_proxy(&self, proxy_key: &str) -> Result<Option<Proxy>, PoolError> {
        self.await_ready().await?;
        let fields = self.backend.hget_all(proxy_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Proxy::from_fields(&fields).map(Some)
    }

    pub async fn get_all_queues(&self) -> Result<Vec<Queue>, PoolError> {
        self.await_ready().await?;
        let mut keys = self.backend.keys("q_*").await?;
        keys.extend(self.backend.keys("qt_*").await?);
        let mut queues = Vec::with_capacity(keys.len());
        for key in keys {
            queues.push(Queue::from_fields(&self.backend.hget_all(&key).await?)?);
        }
        Ok(queues)
    }

    pub async fn get_queue_by_domain(&self, domain: &str) -> Result<Option<Queue>, PoolError> {
        Ok(self
            .get_all_queues()
            .await?
            .into_iter()
            .find(|q| q.domain == domain))
    }

    pub async fn get_queue_by_id(&self, queue_id: i64) -> Result<Option<Queue>, PoolError> {
        self.await_ready().await?;
        let key = format!("q_{queue_id}");
        let fields = self.backend.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Queue::from_fields(&fields).map(Some)
    }

    pub async fn queue_exists(&self, queue_key: &str) -> Result<bool, PoolError> {
        self.await_ready().await?;
        self.backend.exists(queue_key).await
    }

    pub async fn get_proxy_by_address_and_port(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Option<Proxy>, PoolError> {
        self.await_ready().await?;
        let mut keys = self.backend.keys("p_*").await?;
        keys.extend(self.backend.keys("pt_*").await?);
        for key in keys {
            let proxy = Proxy::from_fields(&self.backend.hget_all(&key).await?)?;
            if proxy.address == address && proxy.port == port {
                return Ok(Some(proxy));
            }
        }
        Ok(None)
    }

    /// Every detail cached for a queue, regardless of active flag.
    pub async fn get_all_queue_details(&self, queue_key: &str) -> Result<Vec<Detail>, PoolError> {
        self.await_ready().await?;
        // Proxy keys start with 'p', so this cannot also match details of a
        // queue whose key merely extends ours (q_1 vs q_12).
        let keys = self.backend.keys(&format!("d_{queue_key}_p*")).await?;
        let mut details = Vec::with_capacity(keys.len());
        for key in keys {
            details.push(Detail::from_fields(&self.backend.hget_all(&key).await?)?);
        }
        Ok(details)
    }

    // Gated list primitives backing the rotation queues.

    pub(crate) async fn list_push(&self, list_key: &str, value: &str) -> Result<(), PoolError> {
        self.await_ready().await?;
        self.backend.rpush(list_key, value).await
    }

    pub(crate) async fn list_pop(&self, list_key: &str) -> Result<Option<String>, PoolError> {
        self.await_ready().await?;
        self.backend.lpop(list_key).await
    }

    pub(crate) async fn list_len(&self, list_key: &str) -> Result<usize, PoolError> {
        self.await_ready().await?;
        self.backend.llen(list_key).await
    }

    pub(crate) async fn list_clear(&self, list_key: &str) -> Result<(), PoolError> {
        self.await_ready().await?;
        self.backend.del(list_key).await
    }

    pub(crate) async fn detail_recorded_queue_key(
        &self,
        detail_key: &str,
    ) -> Result<Option<String>, PoolError> {
        self.await_ready().await?;
        self.backend.hget(detail_key, "queue_key").await
    }

    /// Write-back: reconcile the cache into the durable store, then discard
    /// the cache entirely (COLD). Assumes a maintenance window with no
    /// concurrent mutators; the next [`CacheStore::warm`] re-bootstraps.
    pub async fn sync_to_db(&self) -> Result<(), PoolError> {
        self.await_ready().await?;

        // Step 1: persist temp-id queues and proxies, recording id mappings.
        let mut queue_ids: HashMap<String, i64> = HashMap::new();
        for key in self.backend.keys("qt_*").await? {
            let mut queue = Queue::from_fields(&self.backend.hget_all(&key).await?)?;
            queue.queue_key = None;
            let id = self.durable.insert_queue(&queue).await?;
            queue_ids.insert(key, id);
        }

        let mut proxy_ids: HashMap<String, Option<i64>> = HashMap::new();
        for key in self.backend.keys("pt_*").await? {
            let mut proxy = Proxy::from_fields(&self.backend.hget_all(&key).await?)?;
            proxy.proxy_key = None;
            match self.durable.insert_proxy(&proxy).await {
                Ok(id) => {
                    proxy_ids.insert(key, Some(id));
                }
                Err(PoolError::DuplicateEntity(_)) => {
                    // Another writer persisted the same (address, port).
                    warn!("duplicate proxy {}, leaving id unresolved", proxy.urlify());
                    proxy_ids.insert(key, None);
                }
                Err(e) => return Err(e),
            }
        }

        // Step 2: insert new details with resolved references.
        let mut new_detail_keys = self.backend.keys("d_qt*").await?;
        new_detail_keys.extend(self.backend.keys("d_*pt*").await?);
        for key in &new_detail_keys {
            self.backend.sadd(NEW_DETAILS_KEY, key).await?;
        }
        let new_detail_keys = self.backend.smembers(NEW_DETAILS_KEY).await?;

        for key in new_detail_keys {
            let fields = self.backend.hget_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let mut detail = Detail::from_fields(&fields)?;

            if detail.proxy_id.is_none() {
                let proxy_key = detail.proxy_key.as_deref().unwrap_or_default();
                match proxy_ids.get(proxy_key) {
                    Some(Some(id)) => detail.proxy_id = Some(*id),
                    Some(None) => {
                        warn!("discarding detail {key}: its proxy already exists under another id");
                        continue;
                    }
                    None => {
                        return Err(PoolError::ReconciliationFailure(format!(
                            "new detail {key} references unknown proxy '{proxy_key}'"
                        )))
                    }
                }
            }
            if detail.queue_id.is_none() {
                let queue_key = detail.queue_key.as_deref().unwrap_or_default();
                match queue_ids.get(queue_key) {
                    Some(id) => detail.queue_id = Some(*id),
                    None => {
                        return Err(PoolError::ReconciliationFailure(format!(
                            "new detail {key} references unknown queue '{queue_key}'"
                        )))
                    }
                }
            }

            match self.durable.insert_detail(&detail).await {
                Ok(_) => {}
                Err(PoolError::DuplicateEntity(_)) => {
                    warn!("detail {key} already persisted by another writer");
                }
                Err(e) => return Err(e),
            }
        }

        // Step 3: push updates for changed, already-durable details.
        for key in self.backend.sdiff(CHANGED_DETAILS_KEY, NEW_DETAILS_KEY).await? {
            let fields = self.backend.hget_all(&key).await?;
            if fields.is_empty() {
                return Err(PoolError::ReconciliationFailure(format!(
                    "changed detail {key} vanished from the cache"
                )));
            }
            let detail = Detail::from_fields(&fields)?;
            if detail.queue_id.is_none() || detail.proxy_id.is_none() {
                return Err(PoolError::ReconciliationFailure(format!(
                    "changed detail {key} has no durable queue or proxy id"
                )));
            }
            self.durable.update_detail(&detail).await?;
        }

        // Step 4: the durable store is authoritative again; drop the cache.
        info!("cache synced to the durable store, resetting cache");
        self.backend.flush_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::durable::MemoryDurableStore;
    use crate::model::Protocol;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig::builder()
            .sync_poll_interval(Duration::from_millis(10))
            .connect_attempts(2)
            .connect_interval(Duration::from_millis(1))
            .build()
    }

    async fn open_cache() -> (Arc<MemoryBackend>, Arc<MemoryDurableStore>, Arc<CacheStore>) {
        let backend = Arc::new(MemoryBackend::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let cache = CacheStore::open(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Arc::clone(&durable) as Arc<dyn DurableStore>,
            test_config(),
        )
        .await
        .unwrap();
        (backend, durable, cache)
    }

    #[tokio::test]
    async fn bootstrap_registers_reserved_queues() {
        let (backend, _durable, cache) = open_cache().await;

        let queues = cache.get_all_queues().await.unwrap();
        assert_eq!(queues.len(), 2);
        assert!(queues.iter().any(|q| q.queue_id == Some(1)));
        assert!(queues.iter().any(|q| q.queue_id == Some(2)));

        // Temp-id counters were reset for the new cache generation.
        assert_eq!(backend.get("temp_id_counter_q").await.unwrap().unwrap(), "0");
        assert_eq!(backend.get("temp_id_counter_p").await.unwrap().unwrap(), "0");
        // Bootstrap released the lock.
        assert!(!backend.exists("syncing").await.unwrap());
    }

    #[tokio::test]
    async fn register_mints_temporary_ids_in_order() {
        let (_backend, _durable, cache) = open_cache().await;

        let a = cache
            .register_proxy(Proxy::new("1.1.1.1", 80, Protocol::Http))
            .await
            .unwrap();
        let b = cache
            .register_proxy(Proxy::new("2.2.2.2", 80, Protocol::Http))
            .await
            .unwrap();
        assert_eq!(a.proxy_key.as_deref(), Some("pt_1"));
        assert_eq!(b.proxy_key.as_deref(), Some("pt_2"));

        let q = cache.register_queue(Queue::new("example.com")).await.unwrap();
        assert_eq!(q.queue_key.as_deref(), Some("qt_1"));
    }

    #[tokio::test]
    async fn register_round_trips_every_field() {
        let (_backend, _durable, cache) = open_cache().await;

        let proxy = Proxy::new("1.2.3.4", 8080, Protocol::Https);
        let stored = cache.register_proxy(proxy.clone()).await.unwrap();
        assert_eq!(stored.address, proxy.address);
        assert_eq!(stored.port, proxy.port);
        assert_eq!(stored.protocol, proxy.protocol);
        // Only the cache key was added.
        assert!(stored.proxy_key.is_some());
        assert_eq!(stored.proxy_id, None);

        let reread = cache
            .get_proxy(stored.proxy_key.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reread, stored);
    }

    #[tokio::test]
    async fn register_detail_requires_cached_references() {
        let (_backend, _durable, cache) = open_cache().await;

        let dangling = Detail::joining("pt_99", "q_1");
        assert!(matches!(
            cache.register_detail(dangling).await,
            Err(PoolError::RotationQueueInvalid(_))
        ));

        let unreferenced = Detail::default();
        assert!(matches!(
            cache.register_detail(unreferenced).await,
            Err(PoolError::RotationQueueInvalid(_))
        ));
    }

    #[tokio::test]
    async fn register_detail_is_idempotent_per_pairing() {
        let (_backend, _durable, cache) = open_cache().await;

        let proxy = cache
            .register_proxy(Proxy::new("1.1.1.1", 80, Protocol::Http))
            .await
            .unwrap();
        let key = proxy.proxy_key.unwrap();

        let first = cache
            .register_detail(Detail::joining(key.clone(), "q_1"))
            .await
            .unwrap();

        let mut second = Detail::joining(key, "q_1");
        second.bad_count = 42;
        let stored = cache.register_detail(second).await.unwrap();

        // Existing record returned unchanged, not overwritten.
        assert_eq!(stored, first);
        assert_eq!(stored.bad_count, 0);
    }

    #[tokio::test]
    async fn update_detail_marks_changed() {
        let (backend, _durable, cache) = open_cache().await;

        let proxy = cache
            .register_proxy(Proxy::new("1.1.1.1", 80, Protocol::Http))
            .await
            .unwrap();
        let mut detail = cache
            .register_detail(Detail::joining(proxy.proxy_key.unwrap(), "q_1"))
            .await
            .unwrap();

        detail.bad_count = 3;
        cache.update_detail(&detail).await.unwrap();

        let key = detail.detail_key().unwrap();
        assert!(backend
            .smembers("changed_details")
            .await
            .unwrap()
            .contains(&key));
        assert_eq!(cache.get_detail(&key).await.unwrap().unwrap().bad_count, 3);
    }

    #[tokio::test]
    async fn warm_cache_skips_bootstrap() {
        let (backend, durable, _cache) = open_cache().await;

        let again = CacheStore::open(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Arc::clone(&durable) as Arc<dyn DurableStore>,
            test_config(),
        )
        .await
        .unwrap();

        // No duplicate registrations.
        assert_eq!(again.get_all_queues().await.unwrap().len(), 2);
        assert_eq!(backend.keys("q_*").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn simultaneous_cold_start_bootstraps_once() {
        let backend = Arc::new(MemoryBackend::new());
        let durable = Arc::new(MemoryDurableStore::new());

        let open_one = CacheStore::open(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Arc::clone(&durable) as Arc<dyn DurableStore>,
            test_config(),
        );
        let open_two = CacheStore::open(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Arc::clone(&durable) as Arc<dyn DurableStore>,
            test_config(),
        );

        let (one, two) = tokio::join!(open_one, open_two);
        let (one, two) = (one.unwrap(), two.unwrap());

        assert_eq!(backend.keys("q_*").await.unwrap().len(), 2);
        assert_eq!(one.get_all_queues().await.unwrap().len(), 2);
        assert_eq!(two.get_all_queues().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn operations_block_while_another_process_syncs() {
        let (backend, _durable, cache) = open_cache().await;

        // Simulate another process holding the sync flag.
        assert!(backend
            .try_lock("syncing", Duration::from_secs(60))
            .await
            .unwrap());

        let unlocker = Arc::clone(&backend);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            unlocker.unlock("syncing").await.unwrap();
        });

        // Completes only once the flag clears.
        let queues = cache.get_all_queues().await.unwrap();
        assert_eq!(queues.len(), 2);
        assert!(!backend.exists("syncing").await.unwrap());
    }

    #[tokio::test]
    async fn sync_persists_and_resets_then_warm_rebootstraps() {
        let (backend, durable, cache) = open_cache().await;

        let proxy = cache
            .register_proxy(Proxy::new("1.1.1.1", 80, Protocol::Http))
            .await
            .unwrap();
        let detail = cache
            .register_detail(Detail::joining(proxy.proxy_key.unwrap(), "q_1"))
            .await
            .unwrap();
        cache
            .mark_detail_new(&detail.detail_key().unwrap())
            .await
            .unwrap();

        cache.sync_to_db().await.unwrap();

        assert_eq!(durable.proxy_count(), 1);
        assert_eq!(durable.detail_count(), 1);
        assert!(backend.keys("*").await.unwrap().is_empty());

        cache.warm().await.unwrap();
        // Rebuilt from the durable store under durable keys now.
        let reloaded = cache
            .get_proxy_by_address_and_port("1.1.1.1", 80)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.proxy_key.as_deref(), Some("p_1"));
        assert_eq!(reloaded.proxy_id, Some(1));
    }

    #[tokio::test]
    async fn sync_twice_performs_no_additional_writes() {
        let (_backend, durable, cache) = open_cache().await;

        let proxy = cache
            .register_proxy(Proxy::new("1.1.1.1", 80, Protocol::Http))
            .await
            .unwrap();
        let detail = cache
            .register_detail(Detail::joining(proxy.proxy_key.unwrap(), "q_1"))
            .await
            .unwrap();
        cache
            .mark_detail_new(&detail.detail_key().unwrap())
            .await
            .unwrap();

        cache.sync_to_db().await.unwrap();
        let proxies = durable.proxy_count();
        let details = durable.detail_count();
        let queues = durable.queue_count();

        // Second run over the now-empty cache is a no-op.
        cache.sync_to_db().await.unwrap();
        assert_eq!(durable.proxy_count(), proxies);
        assert_eq!(durable.detail_count(), details);
        assert_eq!(durable.queue_count(), queues);
    }

    #[tokio::test]
    async fn durable_keys_imply_durable_ids() {
        let (_backend, _durable, cache) = open_cache().await;

        let mut proxy = Proxy::new("1.1.1.1", 80, Protocol::Http);
        proxy.proxy_key = Some("p_9".into());
        cache.register_proxy(proxy).await.unwrap();

        let detail = cache
            .register_detail(Detail::joining("p_9", "q_1"))
            .await
            .unwrap();
        assert_eq!(detail.proxy_id, Some(9));
        assert_eq!(detail.queue_id, Some(1));
    }

    #[tokio::test]
    async fn changed_detail_with_lost_record_is_fatal() {
        let (backend, _durable, cache) = open_cache().await;

        // A changed-set entry whose record is gone: lost state, never
        // silently dropped.
        backend
            .sadd("changed_details", "d_q_1_p_77")
            .await
            .unwrap();

        assert!(matches!(
            cache.sync_to_db().await,
            Err(PoolError::ReconciliationFailure(_))
        ));
    }
}
