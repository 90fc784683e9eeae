//! At-most-once markers for activation deliveries.
//!
//! A marker is added atomically the first time a delivery is seen; a second
//! attempt to add it inside the TTL reports "already present" and the
//! delivery is skipped.

use crate::error::TaskworkerError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait AtMostOnceStore: Send + Sync {
    /// Atomically mark `key`. Returns `true` when the marker was absent.
    async fn add_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, TaskworkerError>;
}

/// Markers kept in process memory; shared by every slot of one supervisor.
///
/// Expired markers are swept from an expiry-ordered heap, so each add only
/// touches the markers that have actually expired.
#[derive(Debug, Default)]
pub struct InMemoryAtMostOnceStore {
    inner: Mutex<Markers>,
}

#[derive(Debug, Default)]
struct Markers {
    expires_at: HashMap<String, Instant>,
    by_expiry: BinaryHeap<Reverse<(Instant, String)>>,
}

impl Markers {
    fn sweep(&mut self, now: Instant) {
        while let Some(Reverse((at, _))) = self.by_expiry.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((at, key))) = self.by_expiry.pop() {
                // a newer marker for the same key has its own heap entry
                if self.expires_at.get(&key) == Some(&at) {
                    self.expires_at.remove(&key);
                }
            }
        }
    }
}

impl InMemoryAtMostOnceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Markers> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Markers held, including expired ones not swept yet.
    pub fn len(&self) -> usize {
        self.lock().expires_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AtMostOnceStore for InMemoryAtMostOnceStore {
    async fn add_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, TaskworkerError> {
        let now = Instant::now();
        let mut markers = self.lock();
        markers.sweep(now);

        if markers.expires_at.contains_key(key) {
            return Ok(false);
        }
        let at = now + ttl;
        markers.expires_at.insert(key.to_string(), at);
        markers.by_expiry.push(Reverse((at, key.to_string())));
        Ok(true)
    }
}

/// Open a managed Redis connection, shared by the at-most-once store and
/// the options source.
pub async fn connect_redis(url: &str) -> Result<ConnectionManager, TaskworkerError> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Markers in Redis, shared across supervisor processes.
#[derive(Clone)]
pub struct RedisAtMostOnceStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisAtMostOnceStore {
    pub async fn connect(url: &str) -> Result<Self, TaskworkerError> {
        Ok(Self::new(connect_redis(url).await?))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: "taskworker:at_most_once".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl AtMostOnceStore for RedisAtMostOnceStore {
    async fn add_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, TaskworkerError> {
        let mut conn = self.conn.clone();
        // SET NX replies OK when it wrote the key and nil when it already existed
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_second_add_is_rejected() {
        let store = InMemoryAtMostOnceStore::new();
        assert!(store.add_if_absent("abc:0", TTL).await.unwrap());
        assert!(!store.add_if_absent("abc:0", TTL).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let store = InMemoryAtMostOnceStore::new();
        assert!(store.add_if_absent("b:0", TTL).await.unwrap());
        assert!(store.add_if_absent("a:0", TTL).await.unwrap());
        assert!(store.add_if_absent("a:1", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = InMemoryAtMostOnceStore::new();
        assert!(store.add_if_absent("abc:0", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.add_if_absent("abc:0", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_markers_are_swept() {
        let store = InMemoryAtMostOnceStore::new();
        for i in 0..50 {
            store
                .add_if_absent(&format!("short:{i}"), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert!(store.add_if_absent("long:0", TTL).await.unwrap());
        assert_eq!(store.len(), 51);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.add_if_absent("long:1", TTL).await.unwrap());
        assert_eq!(store.len(), 2);
        assert!(!store.add_if_absent("long:0", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_readded_marker_outlives_its_stale_expiry() {
        let store = InMemoryAtMostOnceStore::new();
        assert!(store.add_if_absent("abc:0", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        // sweeps the first marker, then adds a long-lived one
        assert!(store.add_if_absent("abc:0", TTL).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.add_if_absent("abc:0", TTL).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_admit_exactly_one() {
        let store = Arc::new(InMemoryAtMostOnceStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_if_absent("abc:0", TTL).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
