//! Rotation queues: one FIFO of dispatchable details per
//! `(queue, active | inactive)` pair, built on cache store primitives.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::CacheStore;
use crate::error::PoolError;
use crate::model::Detail;
use crate::utils::now_ts;

/// FIFO of detail keys for one side (active or inactive) of one queue.
/// Dequeue-then-requeue gives round-robin reuse; concurrent workers may
/// observe the same detail more than once, which rotation tolerates.
pub struct RotationQueue {
    cache: Arc<CacheStore>,
    queue_key: String,
    active: bool,
}

impl RotationQueue {
    pub fn new(cache: Arc<CacheStore>, queue_key: impl Into<String>, active: bool) -> Self {
        Self {
            cache,
            queue_key: queue_key.into(),
            active,
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn is_active_side(&self) -> bool {
        self.active
    }

    fn list_key_for(&self, active: bool) -> String {
        let side = if active { "active" } else { "inactive" };
        format!("rotation_{side}_{}", self.queue_key)
    }

    fn list_key(&self) -> String {
        self.list_key_for(self.active)
    }

    /// The oppositely-typed sub-queue of the same queue.
    pub fn sibling(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            queue_key: self.queue_key.clone(),
            active: !self.active,
        }
    }

    /// Clear an expired blacklist before deciding whether to enqueue.
    async fn refresh_blacklist(&self, detail: &mut Detail) -> Result<(), PoolError> {
        if !detail.blacklisted {
            return Ok(());
        }
        let elapsed = now_ts().saturating_sub(detail.last_used);
        if elapsed >= self.cache.config().blacklist_time.as_secs() as i64
            && detail.blacklisted_count < self.cache.config().max_blacklist_count
        {
            debug!("unblacklisting detail for queue {}", self.queue_key);
            detail.blacklisted = false;
            self.cache.update_detail(detail).await?;
        }
        Ok(())
    }

    /// Append a detail, re-evaluating blacklist expiry first. Blacklisted
    /// and socks-proxy details are dropped (logged, non-fatal); a detail
    /// recorded against a different queue is fatal; a detail whose `active`
    /// flag mismatches this side is routed to the sibling instead.
    pub async fn enqueue(&self, detail: &mut Detail) -> Result<(), PoolError> {
        self.refresh_blacklist(detail).await?;
        if detail.blacklisted {
            warn!("detail is blacklisted, will not enqueue");
            return Ok(());
        }

        let proxy_key = detail.proxy_key.clone().ok_or_else(|| {
            PoolError::RotationQueueInvalid("detail references no proxy".into())
        })?;
        let proxy = self.cache.get_proxy(&proxy_key).await?.ok_or_else(|| {
            PoolError::RotationQueueInvalid(format!("no cached proxy '{proxy_key}' for detail"))
        })?;
        if proxy.protocol.is_socks() {
            warn!("socks proxies are not rotated, will not enqueue {}", proxy.urlify());
            return Ok(());
        }

        let detail_key = detail.detail_key().ok_or_else(|| {
            PoolError::RotationQueueInvalid("detail has no cache key".into())
        })?;
        let recorded = self.cache.detail_recorded_queue_key(&detail_key).await?;
        if recorded.as_deref() != Some(self.queue_key.as_str()) {
            return Err(PoolError::RotationQueueInvalid(format!(
                "detail {detail_key} belongs to queue {:?}, not {}",
                recorded, self.queue_key
            )));
        }

        // Self-correcting routing: land on the side the flag says.
        let target = self.list_key_for(detail.active);
        self.cache.list_push(&target, &detail_key).await
    }

    /// Pop the head. With `requeue`, it goes straight back to the tail
    /// (through the same enqueue checks) for round-robin reuse.
    pub async fn dequeue(&self, requeue: bool) -> Result<Detail, PoolError> {
        let Some(detail_key) = self.cache.list_pop(&self.list_key()).await? else {
            return Err(PoolError::RotationQueueEmpty(self.queue_key.clone()));
        };
        let mut detail = self.cache.get_detail(&detail_key).await?.ok_or_else(|| {
            PoolError::RotationQueueInvalid(format!(
                "rotation entry {detail_key} has no cached record"
            ))
        })?;

        if requeue {
            self.enqueue(&mut detail).await?;
        }
        Ok(detail)
    }

    pub async fn length(&self) -> Result<usize, PoolError> {
        self.cache.list_len(&self.list_key()).await
    }

    pub async fn is_empty(&self) -> Result<bool, PoolError> {
        Ok(self.length().await? == 0)
    }

    pub async fn clear(&self) -> Result<(), PoolError> {
        self.cache.list_clear(&self.list_key()).await
    }

    /// Rebuild this side's membership from the cache's current detail set
    /// for the queue, replacing prior contents.
    pub async fn reload(&self) -> Result<(), PoolError> {
        let details = self.cache.get_all_queue_details(&self.queue_key).await?;
        self.clear().await?;
        for mut detail in details {
            if detail.active == self.active {
                self.enqueue(&mut detail).await?;
            }
        }
        Ok(())
    }
}
