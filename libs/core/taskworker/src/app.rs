//! The worker application: registry, router, at-most-once store and
//! runtime configuration, shared by the fetch loop and the producer path.

use crate::activation::{TaskActivation, TaskParameters};
use crate::client::TaskProducer;
use crate::constants::DEFAULT_AT_MOST_ONCE_TTL;
use crate::dedup::{AtMostOnceStore, InMemoryAtMostOnceStore};
use crate::error::{RegistryError, TaskworkerError};
use crate::metrics;
use crate::registry::TaskRegistry;
use crate::router::Router;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Keys accepted by [`WorkerApp::set_config`]. Anything else is ignored.
const KNOWN_CONFIG_KEYS: [&str; 3] = ["rpc_secret", "at_most_once_ttl_secs", "at_most_once_fail_open"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAppConfig {
    pub rpc_secret: Option<String>,
    pub at_most_once_ttl_secs: u64,
    /// Run an activation when the at-most-once store cannot be reached.
    /// Off by default: the activation is skipped and the broker redelivers
    /// it once its deadline passes.
    pub at_most_once_fail_open: bool,
}

impl Default for WorkerAppConfig {
    fn default() -> Self {
        Self {
            rpc_secret: None,
            at_most_once_ttl_secs: DEFAULT_AT_MOST_ONCE_TTL.as_secs(),
            at_most_once_fail_open: false,
        }
    }
}

impl WorkerAppConfig {
    pub fn at_most_once_ttl(&self) -> Duration {
        Duration::from_secs(self.at_most_once_ttl_secs.max(1))
    }

    fn apply(&mut self, patch: ConfigPatch) {
        if let Some(rpc_secret) = patch.rpc_secret {
            self.rpc_secret = rpc_secret;
        }
        if let Some(ttl) = patch.at_most_once_ttl_secs {
            self.at_most_once_ttl_secs = ttl;
        }
        if let Some(fail_open) = patch.at_most_once_fail_open {
            self.at_most_once_fail_open = fail_open;
        }
    }
}

/// Keys present in one `set_config` call. `rpc_secret: null` clears the
/// secret, an absent key leaves it alone.
#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    #[serde(default, deserialize_with = "present")]
    rpc_secret: Option<Option<String>>,
    #[serde(default)]
    at_most_once_ttl_secs: Option<u64>,
    #[serde(default)]
    at_most_once_fail_open: Option<bool>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

pub struct WorkerApp {
    registry: Arc<TaskRegistry>,
    router: Router,
    at_most_once: Arc<dyn AtMostOnceStore>,
    config: WorkerAppConfig,
}

impl std::fmt::Debug for WorkerApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerApp")
            .field("application", &self.registry.application())
            .field("router", &self.router)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerApp {
    pub fn new(registry: TaskRegistry, router: Router) -> Self {
        Self {
            registry: Arc::new(registry),
            router,
            at_most_once: Arc::new(InMemoryAtMostOnceStore::new()),
            config: WorkerAppConfig::default(),
        }
    }

    pub fn with_at_most_once_store(mut self, store: Arc<dyn AtMostOnceStore>) -> Self {
        self.at_most_once = store;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &WorkerAppConfig {
        &self.config
    }

    /// Update the runtime configuration from a JSON object.
    ///
    /// Known keys present in `value` overwrite their setting; every other
    /// setting keeps its current value. Unknown keys are dropped so newer
    /// deployments can pass settings this version does not understand.
    /// A known key with the wrong type is an error and changes nothing.
    pub fn set_config(&mut self, value: Value) -> Result<(), TaskworkerError> {
        let Value::Object(map) = &value else {
            return Err(TaskworkerError::config("worker config must be a JSON object"));
        };
        for key in map.keys().filter(|key| !KNOWN_CONFIG_KEYS.contains(&key.as_str())) {
            tracing::debug!(key = %key, "Ignoring unknown worker config key");
        }

        let patch: ConfigPatch = serde_json::from_value(value)
            .map_err(|e| TaskworkerError::config(format!("invalid worker config: {e}")))?;
        self.config.apply(patch);
        Ok(())
    }

    /// Atomically check and mark this delivery.
    ///
    /// `true` the first time a delivery is seen, `false` for a redelivery
    /// within the TTL. When the store fails the answer is `false` unless
    /// `at_most_once_fail_open` is set.
    pub async fn should_attempt_at_most_once(&self, activation: &TaskActivation) -> bool {
        let key = activation.delivery_key();
        match self
            .at_most_once
            .add_if_absent(&key, self.config.at_most_once_ttl())
            .await
        {
            Ok(first) => first,
            Err(e) => {
                let fail_open = self.config.at_most_once_fail_open;
                metrics::record_at_most_once_error(&activation.namespace, fail_open);
                if fail_open {
                    tracing::warn!(task_id = %activation.id, error = %e, "At-most-once check failed, executing anyway");
                } else {
                    tracing::error!(task_id = %activation.id, error = %e, "At-most-once check failed, skipping activation");
                }
                fail_open
            }
        }
    }

    /// Build an activation for `namespace:taskname` and publish it on the
    /// namespace's route. Returns the activation id.
    pub async fn send_task(
        &self,
        producer: &dyn TaskProducer,
        namespace: &str,
        taskname: &str,
        params: &TaskParameters,
    ) -> Result<String, TaskworkerError> {
        let ns = self
            .registry
            .namespace(namespace)
            .ok_or_else(|| RegistryError::UnknownTask {
                namespace: namespace.to_string(),
                taskname: taskname.to_string(),
            })?;
        let activation = ns.create_activation(taskname, params)?;
        let id = activation.id.clone();
        let topic = self.router.route_namespace(namespace);

        producer.produce(&topic, activation).await?;
        tracing::debug!(task_id = %id, namespace, taskname, topic = %topic, "Produced activation");
        Ok(id)
    }
}
