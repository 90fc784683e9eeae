//! Live options read from an external source.
//!
//! [`PolledOptions`] keeps the last values fetched for a fixed set of keys
//! and refreshes them on an interval, so [`OptionsStore::get`] stays a
//! cheap synchronous lookup on the routing path. A failed refresh keeps the
//! previous values.
//!
//! ```text
//! redis  SET taskworker:options:taskworker.route.overrides '{"examples":"examples-hot"}'
//!   └──(every 10s)──▶ PolledOptions ──get()──▶ Router::route_namespace
//! ```

use crate::error::TaskworkerError;
use crate::router::{InMemoryOptions, OptionsStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OptionsSource: Send + Sync {
    /// Current value of `key`, `None` when it is not set.
    async fn fetch(&self, key: &str) -> Result<Option<Value>, TaskworkerError>;
}

/// Options stored as JSON strings under `<prefix>:<key>`.
#[derive(Clone)]
pub struct RedisOptionsSource {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisOptionsSource {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: "taskworker:options".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl OptionsSource for RedisOptionsSource {
    async fn fetch(&self, key: &str) -> Result<Option<Value>, TaskworkerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{}:{}", self.prefix, key))
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(TaskworkerError::from))
            .transpose()
    }
}

pub struct PolledOptions {
    source: Arc<dyn OptionsSource>,
    keys: Vec<String>,
    cache: InMemoryOptions,
}

impl std::fmt::Debug for PolledOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledOptions")
            .field("keys", &self.keys)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PolledOptions {
    pub fn new<I, S>(source: Arc<dyn OptionsSource>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            keys: keys.into_iter().map(Into::into).collect(),
            cache: InMemoryOptions::new(),
        }
    }

    /// Fetch every watched key once. Keys whose fetch fails keep their
    /// previous value; the first error is returned after all keys were tried.
    pub async fn refresh(&self) -> Result<(), TaskworkerError> {
        let mut first_error = None;
        for key in &self.keys {
            match self.source.fetch(key).await {
                Ok(Some(value)) => self.cache.set(key.clone(), value),
                Ok(None) => {
                    self.cache.remove(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Could not refresh option, keeping last value");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Refresh every `interval` in a background task.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = self.refresh().await;
            }
        })
    }
}

impl OptionsStore for PolledOptions {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }
}
