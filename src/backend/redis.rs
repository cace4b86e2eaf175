//! Redis cache backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::CacheBackend;
use crate::error::PoolError;
use crate::retry::{connect_with_retry, RetryPolicy};

pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Connect to redis, retrying within the given budget.
    pub async fn connect(connection_string: &str, policy: RetryPolicy) -> Result<Self, PoolError> {
        let client = Client::open(connection_string)
            .map_err(|e| PoolError::Backend(e.to_string()))?;

        let connection = connect_with_retry("redis", policy, || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;

        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn exists(&self, key: &str) -> Result<bool, PoolError> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.keys(pattern).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), PoolError> {
        let mut conn = self.conn();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), PoolError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, PoolError> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), PoolError> {
        if fields.is_empty() {
            return Ok(());
        }
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(key, &items).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), PoolError> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn sdiff(&self, key: &str, other: &str) -> Result<Vec<String>, PoolError> {
        let mut conn = self.conn();
        Ok(redis::cmd("SDIFF")
            .arg(key)
            .arg(other)
            .query_async(&mut conn)
            .await?)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), PoolError> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, PoolError> {
        let mut conn = self.conn();
        Ok(conn.lpop(key, None).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize, PoolError> {
        let mut conn = self.conn();
        Ok(conn.llen(key).await?)
    }

    async fn flush_all(&self) -> Result<(), PoolError> {
        let mut conn = self.conn();
        redis::cmd("FLUSHALL").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool, PoolError> {
        // SET NX PX: one non-blocking attempt; the TTL frees the lock if the
        // holder dies mid-bootstrap.
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg("locked")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str) -> Result<(), PoolError> {
        self.del(name).await
    }
}
