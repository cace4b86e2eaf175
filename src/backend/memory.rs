//! In-process cache backend.
//!
//! Behaves like the networked store over the subset of operations the cache
//! uses. Backs the unit tests and embedded single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::CacheBackend;
use crate::error::PoolError;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    locks: HashMap<String, Instant>,
}

impl Inner {
    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.sets.contains_key(key)
            || self.lists.contains_key(key)
            || self.lock_live(key)
    }

    fn lock_live(&self, key: &str) -> bool {
        self.locks.get(key).is_some_and(|expiry| *expiry > Instant::now())
    }

    fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.strings
            .keys()
            .chain(self.hashes.keys())
            .chain(self.sets.keys())
            .chain(self.lists.keys())
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Match a key against a `*`-glob pattern (the only wildcard the cache uses).
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'.
    true
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn exists(&self, key: &str) -> Result<bool, PoolError> {
        Ok(self.inner.lock().key_exists(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PoolError> {
        let inner = self.inner.lock();
        let mut matched: Vec<String> = inner
            .all_keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        for (name, expiry) in &inner.locks {
            if *expiry > Instant::now() && glob_match(pattern, name) {
                matched.push(name.clone());
            }
        }
        matched.sort();
        matched.dedup();
        Ok(matched)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PoolError> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), PoolError> {
        self.inner.lock().strings.insert(key.into(), value.into());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, PoolError> {
        let mut inner = self.inner.lock();
        let entry = inner.strings.entry(key.into()).or_insert_with(|| "0".into());
        let next = entry
            .parse::<i64>()
            .map_err(|_| PoolError::Backend(format!("key '{key}' is not an integer")))?
            + 1;
        *entry = next.to_string();
        Ok(next)
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.into()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, PoolError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), PoolError> {
        self.inner
            .lock()
            .sets
            .entry(key.into())
            .or_default()
            .insert(member.into());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, PoolError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sdiff(&self, key: &str, other: &str) -> Result<Vec<String>, PoolError> {
        let inner = self.inner.lock();
        let base = inner.sets.get(key).cloned().unwrap_or_default();
        let subtract = inner.sets.get(other).cloned().unwrap_or_default();
        Ok(base.difference(&subtract).cloned().collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), PoolError> {
        self.inner
            .lock()
            .lists
            .entry(key.into())
            .or_default()
            .push_back(value.into());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, PoolError> {
        Ok(self
            .inner
            .lock()
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    async fn llen(&self, key: &str) -> Result<usize, PoolError> {
        Ok(self.inner.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn flush_all(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
        Ok(())
    }

    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        if inner.lock_live(name) {
            return Ok(false);
        }
        inner.locks.insert(name.into(), Instant::now() + ttl);
        Ok(true)
    }

    async fn unlock(&self, name: &str) -> Result<(), PoolError> {
        self.inner.lock().locks.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn glob_matching() {
        assert!(glob_match("p_*", "p_12"));
        assert!(!glob_match("p_*", "pt_12"));
        assert!(glob_match("pt_*", "pt_12"));
        assert!(glob_match("d_qt*", "d_qt_1_p_5"));
        assert!(glob_match("d_*pt*", "d_q_1_pt_5"));
        assert!(!glob_match("d_*pt*", "d_qt_1_p_5"));
        assert!(glob_match("d_q_1_p*", "d_q_1_pt_3"));
        assert!(!glob_match("d_q_1_p*", "d_q_12_p_3"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn counters_increment() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr("c").await.unwrap(), 1);
        assert_eq!(backend.incr("c").await.unwrap(), 2);
        backend.set("c", "10").await.unwrap();
        assert_eq!(backend.incr("c").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn hashes_round_trip() {
        let backend = MemoryBackend::new();
        let mut fields = HashMap::new();
        fields.insert("a".to_string(), "1".to_string());
        fields.insert("b".to_string(), "2".to_string());
        backend.hset_all("h", &fields).await.unwrap();

        assert_eq!(backend.hget("h", "a").await.unwrap().unwrap(), "1");
        assert_eq!(backend.hget("h", "missing").await.unwrap(), None);
        assert_eq!(backend.hget_all("h").await.unwrap(), fields);
        assert!(backend.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn lists_are_fifo() {
        let backend = MemoryBackend::new();
        backend.rpush("l", "a").await.unwrap();
        backend.rpush("l", "b").await.unwrap();
        assert_eq!(backend.llen("l").await.unwrap(), 2);
        assert_eq!(backend.lpop("l").await.unwrap().unwrap(), "a");
        assert_eq!(backend.lpop("l").await.unwrap().unwrap(), "b");
        assert_eq!(backend.lpop("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_difference() {
        let backend = MemoryBackend::new();
        backend.sadd("changed", "d1").await.unwrap();
        backend.sadd("changed", "d2").await.unwrap();
        backend.sadd("new", "d2").await.unwrap();

        let mut diff = backend.sdiff("changed", "new").await.unwrap();
        diff.sort();
        assert_eq!(diff, vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        assert!(backend.try_lock("syncing", ttl).await.unwrap());
        assert!(!backend.try_lock("syncing", ttl).await.unwrap());
        assert!(backend.exists("syncing").await.unwrap());

        backend.unlock("syncing").await.unwrap();
        assert!(!backend.exists("syncing").await.unwrap());
        assert!(backend.try_lock("syncing", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn flush_drops_everything() {
        let backend = MemoryBackend::new();
        assert_ok!(backend.set("s", "v").await);
        assert_ok!(backend.sadd("set", "m").await);
        assert_ok!(backend.rpush("l", "v").await);
        assert_ok!(backend.flush_all().await);
        assert!(backend.keys("*").await.unwrap().is_empty());
    }
}
