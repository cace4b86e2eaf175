//! In-process durable store.
//!
//! Mirrors the relational constraints (sequential ids, unique
//! `(address, port)` proxies, unique `(queue, proxy)` details) so the cache
//! and pool logic can be exercised without a database.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::DurableStore;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::model::{Detail, Proxy, Queue};
use crate::utils::now_ts;

#[derive(Default)]
struct Inner {
    queues: Vec<Queue>,
    proxies: Vec<Proxy>,
    details: Vec<Detail>,
    next_queue_id: i64,
    next_proxy_id: i64,
    next_detail_id: i64,
}

#[derive(Default)]
pub struct MemoryDurableStore {
    inner: Mutex<Inner>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_queue_id: 1,
                next_proxy_id: 1,
                next_detail_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// Test/introspection helper: total detail count.
    pub fn detail_count(&self) -> usize {
        self.inner.lock().details.len()
    }

    /// Test/introspection helper: total proxy count.
    pub fn proxy_count(&self) -> usize {
        self.inner.lock().proxies.len()
    }

    /// Test/introspection helper: total queue count.
    pub fn queue_count(&self) -> usize {
        self.inner.lock().queues.len()
    }

    fn eligible(
        inner: &Inner,
        queue_id: i64,
        active: bool,
        cutoff: i64,
        limit: usize,
    ) -> Vec<Detail> {
        let mut details: Vec<Detail> = inner
            .details
            .iter()
            .filter(|d| {
                d.queue_id == Some(queue_id) && d.active == active && d.last_used < cutoff
            })
            .cloned()
            .collect();
        details.sort_by_key(|d| d.last_used);
        details.truncate(limit);
        details
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn insert_proxy(&self, proxy: &Proxy) -> Result<i64, PoolError> {
        let mut inner = self.inner.lock();
        if inner
            .proxies
            .iter()
            .any(|p| p.address == proxy.address && p.port == proxy.port)
        {
            return Err(PoolError::DuplicateEntity(format!(
                "proxy {}:{}",
                proxy.address, proxy.port
            )));
        }
        let id = inner.next_proxy_id;
        inner.next_proxy_id += 1;
        let mut stored = proxy.clone();
        stored.proxy_id = Some(id);
        stored.proxy_key = None;
        inner.proxies.push(stored);
        Ok(id)
    }

    async fn insert_queue(&self, queue: &Queue) -> Result<i64, PoolError> {
        let mut inner = self.inner.lock();
        if inner.queues.iter().any(|q| q.domain == queue.domain) {
            return Err(PoolError::DuplicateEntity(format!(
                "queue '{}'",
                queue.domain
            )));
        }
        let id = match queue.queue_id {
            Some(preset) => {
                if inner.queues.iter().any(|q| q.queue_id == Some(preset)) {
                    return Err(PoolError::DuplicateEntity(format!("queue id {preset}")));
                }
                preset
            }
            None => inner.next_queue_id,
        };
        inner.next_queue_id = inner.next_queue_id.max(id + 1);
        let mut stored = queue.clone();
        stored.queue_id = Some(id);
        stored.queue_key = None;
        inner.queues.push(stored);
        Ok(id)
    }

    async fn insert_detail(&self, detail: &Detail) -> Result<i64, PoolError> {
        let (Some(proxy_id), Some(queue_id)) = (detail.proxy_id, detail.queue_id) else {
            return Err(PoolError::ReconciliationFailure(
                "detail insert requires durable proxy and queue ids".into(),
            ));
        };

        let mut inner = self.inner.lock();
        if inner
            .details
            .iter()
            .any(|d| d.queue_id == Some(queue_id) && d.proxy_id == Some(proxy_id))
        {
            return Err(PoolError::DuplicateEntity(format!(
                "detail (queue {queue_id}, proxy {proxy_id})"
            )));
        }
        let id = inner.next_detail_id;
        inner.next_detail_id += 1;
        let mut stored = detail.clone();
        stored.detail_id = Some(id);
        stored.proxy_key = None;
        stored.queue_key = None;
        inner.details.push(stored);
        Ok(id)
    }

    async fn update_detail(&self, detail: &Detail) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let existing = if let Some(id) = detail.detail_id {
            inner.details.iter_mut().find(|d| d.detail_id == Some(id))
        } else if detail.queue_id.is_some() && detail.proxy_id.is_some() {
            inner
                .details
                .iter_mut()
                .find(|d| d.queue_id == detail.queue_id && d.proxy_id == detail.proxy_id)
        } else {
            return Err(PoolError::ReconciliationFailure(
                "detail update requires a detail id or a (queue, proxy) pair".into(),
            ));
        };

        if let Some(stored) = existing {
            let keep_id = stored.detail_id;
            let keep_proxy = stored.proxy_id;
            let keep_queue = stored.queue_id;
            *stored = detail.clone();
            stored.detail_id = keep_id;
            stored.proxy_id = keep_proxy;
            stored.queue_id = keep_queue;
            stored.proxy_key = None;
            stored.queue_key = None;
        }
        Ok(())
    }

    async fn get_queues(&self) -> Result<Vec<Queue>, PoolError> {
        Ok(self.inner.lock().queues.clone())
    }

    async fn get_proxies(&self) -> Result<Vec<Proxy>, PoolError> {
        Ok(self.inner.lock().proxies.clone())
    }

    async fn get_detail_by_queue_and_proxy(
        &self,
        queue_id: i64,
        proxy_id: i64,
    ) -> Result<Option<Detail>, PoolError> {
        Ok(self
            .inner
            .lock()
            .details
            .iter()
            .find(|d| d.queue_id == Some(queue_id) && d.proxy_id == Some(proxy_id))
            .cloned())
    }

    async fn get_proxy_by_address_and_port(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Option<Proxy>, PoolError> {
        Ok(self
            .inner
            .lock()
            .proxies
            .iter()
            .find(|p| p.address == address && p.port == port)
            .cloned())
    }

    async fn init_seed_queues(&self, config: &PoolConfig) -> Result<(), PoolError> {
        config.validate()?;

        let reserved = [
            (config.seed_queue_id, config.seed_queue_domain.clone(), "seed"),
            (
                config.aggregate_queue_id,
                config.aggregate_queue_domain.clone(),
                "aggregate",
            ),
        ];

        for (id, domain, name) in reserved {
            let existing = {
                let inner = self.inner.lock();
                inner
                    .queues
                    .iter()
                    .find(|q| q.domain == domain)
                    .and_then(|q| q.queue_id)
            };
            match existing {
                None => {
                    self.insert_queue(&Queue::with_id(id, domain)).await?;
                }
                Some(found) if found != id => {
                    return Err(PoolError::ConfigurationConflict(format!(
                        "{name} queue id mismatch: configured {id}, store has {found}"
                    )));
                }
                Some(_) => {}
            }
        }

        // Resequence past the maximum, as the relational store does.
        let mut inner = self.inner.lock();
        let max_id = inner.queues.iter().filter_map(|q| q.queue_id).max().unwrap_or(0);
        inner.next_queue_id = inner.next_queue_id.max(max_id + 1);
        Ok(())
    }

    async fn init_seed_details(&self, config: &PoolConfig) -> Result<(), PoolError> {
        let missing: Vec<i64> = {
            let inner = self.inner.lock();
            inner
                .proxies
                .iter()
                .filter_map(|p| p.proxy_id)
                .filter(|pid| {
                    !inner.details.iter().any(|d| {
                        d.proxy_id == Some(*pid)
                            && d.queue_id == Some(config.seed_queue_id)
                    })
                })
                .collect()
        };

        for proxy_id in missing {
            let detail = Detail {
                proxy_id: Some(proxy_id),
                queue_id: Some(config.seed_queue_id),
                ..Detail::default()
            };
            self.insert_detail(&detail).await?;
        }
        Ok(())
    }

    async fn get_seed_details(&self, config: &PoolConfig) -> Result<Vec<Detail>, PoolError> {
        self.init_seed_details(config).await?;

        let cutoff = now_ts() - config.proxy_interval.as_secs() as i64;
        let inner = self.inner.lock();
        let mut details = Self::eligible(
            &inner,
            config.seed_queue_id,
            true,
            cutoff,
            config.initial_seed_count,
        );
        details.extend(Self::eligible(
            &inner,
            config.seed_queue_id,
            false,
            cutoff,
            config.initial_seed_count,
        ));
        Ok(details)
    }

    async fn get_queue_details(
        &self,
        queue_id: i64,
        config: &PoolConfig,
    ) -> Result<Vec<Detail>, PoolError> {
        let cutoff = now_ts() - config.proxy_interval.as_secs() as i64;
        let inner = self.inner.lock();
        let mut details = Self::eligible(&inner, queue_id, true, cutoff, config.active_limit);
        details.extend(Self::eligible(
            &inner,
            queue_id,
            false,
            cutoff,
            config.inactive_limit,
        ));
        Ok(details)
    }
}
