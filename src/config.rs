//! Configuration for the proxy pool.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for the pool, its rotation queues and both storage tiers.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Reserved durable id of the seed queue (global discovery pool).
    pub seed_queue_id: i64,
    /// Reserved durable id of the aggregate queue.
    pub aggregate_queue_id: i64,
    /// Sentinel domain of the seed queue row.
    pub seed_queue_domain: String,
    /// Sentinel domain of the aggregate queue row.
    pub aggregate_queue_domain: String,
    /// Cap on active details loaded per non-seed queue.
    pub active_limit: usize,
    /// Cap on inactive details loaded per non-seed queue.
    pub inactive_limit: usize,
    /// Cap on active/inactive details loaded from the seed queue at bootstrap.
    pub initial_seed_count: usize,
    /// A detail used more recently than this is not eligible for loading.
    pub proxy_interval: Duration,
    /// How long a blacklisted detail stays blacklisted.
    pub blacklist_time: Duration,
    /// Details blacklisted more often than this stay blacklisted for good.
    pub max_blacklist_count: i64,
    /// Consecutive failures before the dispatcher should blacklist a detail.
    pub blacklist_threshold: i64,
    /// Durable store connection attempts before giving up.
    pub connect_attempts: usize,
    /// Pause between durable store connection attempts.
    pub connect_interval: Duration,
    /// Poll interval while waiting for another process to finish bootstrap.
    pub sync_poll_interval: Duration,
    /// Expiry on the bootstrap advisory lock, in case the holder dies.
    pub sync_lock_ttl: Duration,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Reject reserved-queue settings that cannot coexist.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.seed_queue_id == self.aggregate_queue_id {
            return Err(PoolError::ConfigurationConflict(
                "seed queue and aggregate queue cannot share an id".into(),
            ));
        }
        if self.seed_queue_domain == self.aggregate_queue_domain {
            return Err(PoolError::ConfigurationConflict(
                "seed queue and aggregate queue cannot share a domain".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::new().build()
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    seed_queue_id: Option<i64>,
    aggregate_queue_id: Option<i64>,
    seed_queue_domain: Option<String>,
    aggregate_queue_domain: Option<String>,
    active_limit: Option<usize>,
    inactive_limit: Option<usize>,
    initial_seed_count: Option<usize>,
    proxy_interval: Option<Duration>,
    blacklist_time: Option<Duration>,
    max_blacklist_count: Option<i64>,
    blacklist_threshold: Option<i64>,
    connect_attempts: Option<usize>,
    connect_interval: Option<Duration>,
    sync_poll_interval: Option<Duration>,
    sync_lock_ttl: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            seed_queue_id: None,
            aggregate_queue_id: None,
            seed_queue_domain: None,
            aggregate_queue_domain: None,
            active_limit: None,
            inactive_limit: None,
            initial_seed_count: None,
            proxy_interval: None,
            blacklist_time: None,
            max_blacklist_count: None,
            blacklist_threshold: None,
            connect_attempts: None,
            connect_interval: None,
            sync_poll_interval: None,
            sync_lock_ttl: None,
        }
    }

    /// Set the reserved seed queue id.
    pub fn seed_queue_id(mut self, id: i64) -> Self {
        self.seed_queue_id = Some(id);
        self
    }

    /// Set the reserved aggregate queue id.
    pub fn aggregate_queue_id(mut self, id: i64) -> Self {
        self.aggregate_queue_id = Some(id);
        self
    }

    /// Set the seed queue sentinel domain.
    pub fn seed_queue_domain(mut self, domain: impl Into<String>) -> Self {
        self.seed_queue_domain = Some(domain.into());
        self
    }

    /// Set the aggregate queue sentinel domain.
    pub fn aggregate_queue_domain(mut self, domain: impl Into<String>) -> Self {
        self.aggregate_queue_domain = Some(domain.into());
        self
    }

    /// Set the active detail cap per non-seed queue.
    pub fn active_limit(mut self, limit: usize) -> Self {
        self.active_limit = Some(limit);
        self
    }

    /// Set the inactive detail cap per non-seed queue.
    pub fn inactive_limit(mut self, limit: usize) -> Self {
        self.inactive_limit = Some(limit);
        self
    }

    /// Set the bootstrap seed detail cap.
    pub fn initial_seed_count(mut self, count: usize) -> Self {
        self.initial_seed_count = Some(count);
        self
    }

    /// Set the minimum interval before a detail may be loaded again.
    pub fn proxy_interval(mut self, interval: Duration) -> Self {
        self.proxy_interval = Some(interval);
        self
    }

    /// Set the blacklist duration.
    pub fn blacklist_time(mut self, time: Duration) -> Self {
        self.blacklist_time = Some(time);
        self
    }

    /// Set the blacklist count beyond which a detail is never unblacklisted.
    pub fn max_blacklist_count(mut self, count: i64) -> Self {
        self.max_blacklist_count = Some(count);
        self
    }

    /// Set the failure count at which the dispatcher should blacklist.
    pub fn blacklist_threshold(mut self, threshold: i64) -> Self {
        self.blacklist_threshold = Some(threshold);
        self
    }

    /// Set the durable store connection attempt budget.
    pub fn connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = Some(attempts);
        self
    }

    /// Set the pause between durable store connection attempts.
    pub fn connect_interval(mut self, interval: Duration) -> Self {
        self.connect_interval = Some(interval);
        self
    }

    /// Set the poll interval used while another process bootstraps.
    pub fn sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = Some(interval);
        self
    }

    /// Set the expiry on the bootstrap advisory lock.
    pub fn sync_lock_ttl(mut self, ttl: Duration) -> Self {
        self.sync_lock_ttl = Some(ttl);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            seed_queue_id: self.seed_queue_id.unwrap_or(1),
            aggregate_queue_id: self.aggregate_queue_id.unwrap_or(2),
            seed_queue_domain: self
                .seed_queue_domain
                .unwrap_or_else(|| "RESERVED_SEED_QUEUE".to_string()),
            aggregate_queue_domain: self
                .aggregate_queue_domain
                .unwrap_or_else(|| "RESERVED_AGGREGATE_QUEUE".to_string()),
            active_limit: self.active_limit.unwrap_or(100),
            inactive_limit: self.inactive_limit.unwrap_or(100),
            initial_seed_count: self.initial_seed_count.unwrap_or(200),
            proxy_interval: self.proxy_interval.unwrap_or(Duration::from_secs(300)),
            blacklist_time: self.blacklist_time.unwrap_or(Duration::from_secs(1800)),
            max_blacklist_count: self.max_blacklist_count.unwrap_or(5),
            blacklist_threshold: self.blacklist_threshold.unwrap_or(3),
            connect_attempts: self.connect_attempts.unwrap_or(10),
            connect_interval: self.connect_interval.unwrap_or(Duration::from_secs(5)),
            sync_poll_interval: self.sync_poll_interval.unwrap_or(Duration::from_secs(5)),
            sync_lock_ttl: self.sync_lock_ttl.unwrap_or(Duration::from_secs(120)),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
