//! Postgres durable store.
//!
//! Each entity has a fixed schema and a fixed parameterized statement per
//! operation. Sequences back the durable ids; bootstrap resequences them
//! past the current maximum under an exclusive table lock so manual or bulk
//! inserts cannot cause id collisions later.

use async_trait::async_trait;
use log::info;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::DurableStore;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::model::{Detail, Proxy, Queue};
use crate::retry::{connect_with_retry, RetryPolicy};
use crate::utils::now_ts;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queues (
    queue_id BIGSERIAL PRIMARY KEY,
    domain TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS proxies (
    proxy_id BIGSERIAL PRIMARY KEY,
    address TEXT NOT NULL,
    port INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    UNIQUE (address, port)
);
CREATE TABLE IF NOT EXISTS details (
    detail_id BIGSERIAL PRIMARY KEY,
    proxy_id BIGINT NOT NULL REFERENCES proxies (proxy_id),
    queue_id BIGINT NOT NULL REFERENCES queues (queue_id),
    active BOOLEAN NOT NULL DEFAULT FALSE,
    load_time DOUBLE PRECISION NOT NULL DEFAULT 0,
    last_active BIGINT NOT NULL DEFAULT 0,
    last_used BIGINT NOT NULL DEFAULT 0,
    bad_count BIGINT NOT NULL DEFAULT 0,
    blacklisted BOOLEAN NOT NULL DEFAULT FALSE,
    blacklisted_count BIGINT NOT NULL DEFAULT 0,
    lifetime_good BIGINT NOT NULL DEFAULT 0,
    lifetime_bad BIGINT NOT NULL DEFAULT 0,
    UNIQUE (queue_id, proxy_id)
);
";

pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    /// Connect within the bounded retry budget and create the schema if it
    /// does not exist yet.
    pub async fn connect(connection_string: &str, policy: RetryPolicy) -> Result<Self, PoolError> {
        let pool = connect_with_retry("postgres", policy, || async {
            PgPoolOptions::new()
                .max_connections(10)
                .connect(connection_string)
                .await
        })
        .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PoolError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Move a sequence past the table's current maximum id. Runs under an
    /// exclusive table lock so concurrent inserts cannot slip in between the
    /// MAX read and the setval.
    async fn resequence(&self, table: &str, id_column: &str, sequence: &str) -> Result<(), PoolError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("LOCK TABLE {table} IN EXCLUSIVE MODE"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "SELECT setval('{sequence}', COALESCE((SELECT MAX({id_column}) + 1 FROM {table}), 1), false)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn eligible_details(
        &self,
        queue_id: i64,
        active: bool,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<Detail>, PoolError> {
        let rows = sqlx::query(
            "SELECT * FROM details \
             WHERE queue_id = $1 AND active = $2 AND last_used < $3 \
             ORDER BY last_used ASC LIMIT $4",
        )
        .bind(queue_id)
        .bind(active)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(detail_from_row).collect()
    }
}

fn queue_from_row(row: &PgRow) -> Result<Queue, PoolError> {
    Ok(Queue {
        queue_id: Some(row.try_get("queue_id")?),
        domain: row.try_get("domain")?,
        queue_key: None,
    })
}

fn proxy_from_row(row: &PgRow) -> Result<Proxy, PoolError> {
    let port: i32 = row.try_get("port")?;
    let protocol: String = row.try_get("protocol")?;
    Ok(Proxy {
        proxy_id: Some(row.try_get("proxy_id")?),
        address: row.try_get("address")?,
        port: port as u16,
        protocol: protocol.parse()?,
        proxy_key: None,
    })
}

fn detail_from_row(row: &PgRow) -> Result<Detail, PoolError> {
    Ok(Detail {
        detail_id: Some(row.try_get("detail_id")?),
        proxy_id: Some(row.try_get("proxy_id")?),
        queue_id: Some(row.try_get("queue_id")?),
        proxy_key: None,
        queue_key: None,
        active: row.try_get("active")?,
        load_time: row.try_get("load_time")?,
        last_active: row.try_get("last_active")?,
        last_used: row.try_get("last_used")?,
        bad_count: row.try_get("bad_count")?,
        blacklisted: row.try_get("blacklisted")?,
        blacklisted_count: row.try_get("blacklisted_count")?,
        lifetime_good: row.try_get("lifetime_good")?,
        lifetime_bad: row.try_get("lifetime_bad")?,
    })
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn insert_proxy(&self, proxy: &Proxy) -> Result<i64, PoolError> {
        let row = sqlx::query(
            "INSERT INTO proxies (address, port, protocol) VALUES ($1, $2, $3) \
             RETURNING proxy_id",
        )
        .bind(&proxy.address)
        .bind(proxy.port as i32)
        .bind(proxy.protocol.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("proxy_id")?)
    }

    async fn insert_queue(&self, queue: &Queue) -> Result<i64, PoolError> {
        let row = match queue.queue_id {
            Some(id) => {
                sqlx::query("INSERT INTO queues (queue_id, domain) VALUES ($1, $2) RETURNING queue_id")
                    .bind(id)
                    .bind(&queue.domain)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("INSERT INTO queues (domain) VALUES ($1) RETURNING queue_id")
                    .bind(&queue.domain)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(row.try_get("queue_id")?)
    }

    async fn insert_detail(&self, detail: &Detail) -> Result<i64, PoolError> {
        let (Some(proxy_id), Some(queue_id)) = (detail.proxy_id, detail.queue_id) else {
            return Err(PoolError::ReconciliationFailure(
                "detail insert requires durable proxy and queue ids".into(),
            ));
        };

        let row = sqlx::query(
            "INSERT INTO details \
             (proxy_id, queue_id, active, load_time, last_active, last_used, \
              bad_count, blacklisted, blacklisted_count, lifetime_good, lifetime_bad) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING detail_id",
        )
        .bind(proxy_id)
        .bind(queue_id)
        .bind(detail.active)
        .bind(detail.load_time)
        .bind(detail.last_active)
        .bind(detail.last_used)
        .bind(detail.bad_count)
        .bind(detail.blacklisted)
        .bind(detail.blacklisted_count)
        .bind(detail.lifetime_good)
        .bind(detail.lifetime_bad)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("detail_id")?)
    }

    async fn update_detail(&self, detail: &Detail) -> Result<(), PoolError> {
        const SET_CLAUSE: &str = "active = $1, load_time = $2, last_active = $3, \
             last_used = $4, bad_count = $5, blacklisted = $6, blacklisted_count = $7, \
             lifetime_good = $8, lifetime_bad = $9";

        let query = if detail.detail_id.is_some() {
            format!("UPDATE details SET {SET_CLAUSE} WHERE detail_id = $10")
        } else if detail.queue_id.is_some() && detail.proxy_id.is_some() {
            format!("UPDATE details SET {SET_CLAUSE} WHERE queue_id = $10 AND proxy_id = $11")
        } else {
            return Err(PoolError::ReconciliationFailure(
                "detail update requires a detail id or a (queue, proxy) pair".into(),
            ));
        };

        let mut q = sqlx::query(&query)
            .bind(detail.active)
            .bind(detail.load_time)
            .bind(detail.last_active)
            .bind(detail.last_used)
            .bind(detail.bad_count)
            .bind(detail.blacklisted)
            .bind(detail.blacklisted_count)
            .bind(detail.lifetime_good)
            .bind(detail.lifetime_bad);

        if let Some(id) = detail.detail_id {
            q = q.bind(id);
        } else {
            q = q.bind(detail.queue_id).bind(detail.proxy_id);
        }

        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn get_queues(&self) -> Result<Vec<Queue>, PoolError> {
        let rows = sqlx::query("SELECT * FROM queues ORDER BY queue_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(queue_from_row).collect()
    }

    async fn get_proxies(&self) -> Result<Vec<Proxy>, PoolError> {
        let rows = sqlx::query("SELECT * FROM proxies ORDER BY proxy_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(proxy_from_row).collect()
    }

    async fn get_detail_by_queue_and_proxy(
        &self,
        queue_id: i64,
        proxy_id: i64,
    ) -> Result<Option<Detail>, PoolError> {
        let row = sqlx::query("SELECT * FROM details WHERE queue_id = $1 AND proxy_id = $2")
            .bind(queue_id)
            .bind(proxy_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(detail_from_row).transpose()
    }

    async fn get_proxy_by_address_and_port(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Option<Proxy>, PoolError> {
        let row = sqlx::query("SELECT * FROM proxies WHERE address = $1 AND port = $2")
            .bind(address)
            .bind(port as i32)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(proxy_from_row).transpose()
    }

    async fn init_seed_queues(&self, config: &PoolConfig) -> Result<(), PoolError> {
        config.validate()?;
        info!("initializing reserved queues");

        let reserved = [
            (config.seed_queue_id, &config.seed_queue_domain, "seed"),
            (
                config.aggregate_queue_id,
                &config.aggregate_queue_domain,
                "aggregate",
            ),
        ];

        for (id, domain, name) in reserved {
            let existing = sqlx::query("SELECT queue_id FROM queues WHERE domain = $1")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;
            match existing {
                None => {
                    self.insert_queue(&Queue::with_id(id, domain.clone())).await?;
                }
                Some(row) => {
                    let found: i64 = row.try_get("queue_id")?;
                    if found != id {
                        return Err(PoolError::ConfigurationConflict(format!(
                            "{name} queue id mismatch: configured {id}, store has {found}"
                        )));
                    }
                }
            }
        }

        self.resequence("queues", "queue_id", "queues_queue_id_seq")
            .await?;
        info!("reserved queues ready");
        Ok(())
    }

    async fn init_seed_details(&self, config: &PoolConfig) -> Result<(), PoolError> {
        // Backfill a seed standing for any proxy that lacks one.
        sqlx::query(
            "INSERT INTO details (proxy_id, queue_id) \
             SELECT p.proxy_id, $1 FROM proxies p \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM details d \
                 WHERE d.proxy_id = p.proxy_id AND d.queue_id = $1)",
        )
        .bind(config.seed_queue_id)
        .execute(&self.pool)
        .await?;

        self.resequence("details", "detail_id", "details_detail_id_seq")
            .await?;
        Ok(())
    }

    async fn get_seed_details(&self, config: &PoolConfig) -> Result<Vec<Detail>, PoolError> {
        self.init_seed_details(config).await?;

        let cutoff = now_ts() - config.proxy_interval.as_secs() as i64;
        let mut details = self
            .eligible_details(config.seed_queue_id, true, cutoff, config.initial_seed_count)
            .await?;
        details.extend(
            self.eligible_details(config.seed_queue_id, false, cutoff, config.initial_seed_count)
                .await?,
        );
        Ok(details)
    }

    async fn get_queue_details(
        &self,
        queue_id: i64,
        config: &PoolConfig,
    ) -> Result<Vec<Detail>, PoolError> {
        let cutoff = now_ts() - config.proxy_interval.as_secs() as i64;
        let mut details = self
            .eligible_details(queue_id, true, cutoff, config.active_limit)
            .await?;
        details.extend(
            self.eligible_details(queue_id, false, cutoff, config.inactive_limit)
                .await?,
        );
        Ok(details)
    }
}
