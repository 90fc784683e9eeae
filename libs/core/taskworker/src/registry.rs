//! Task registry: namespaces of named handlers.
//!
//! The registry is built once at startup through `&mut` methods and then
//! shared read-only behind an `Arc`, so lookups from worker slots and child
//! executors never lock.
//!
//! ## Example
//!
//! ```rust,ignore
//! use taskworker::registry::{TaskConfig, TaskRegistry};
//!
//! let mut registry = TaskRegistry::new();
//! registry
//!     .create_namespace("examples")
//!     .register("simple_task", |_params| Ok(()), TaskConfig::default())?;
//! ```

use crate::activation::{RetryState, TaskActivation, TaskParameters};
use crate::compression::compress_parameters;
use crate::constants::{
    COMPRESSION_TYPE_HEADER, DEFAULT_APPLICATION, DEFAULT_MAX_RETRIES, DEFAULT_PROCESSING_DEADLINE,
    MAX_PARAMETER_BYTES_BEFORE_COMPRESSION,
};
use crate::error::{HandlerError, RegistryError, TaskworkerError};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Signature every task handler implements.
pub type TaskHandler = Arc<dyn Fn(&TaskParameters) -> Result<(), HandlerError> + Send + Sync>;

/// Optional per-task (or per-namespace) overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskConfig {
    pub processing_deadline: Option<Duration>,
    pub max_retries: Option<u32>,
    pub compression_threshold: Option<usize>,
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processing_deadline(mut self, deadline: Duration) -> Self {
        self.processing_deadline = Some(deadline);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    /// Fill unset fields from `fallback`.
    fn or(self, fallback: TaskConfig) -> Self {
        Self {
            processing_deadline: self.processing_deadline.or(fallback.processing_deadline),
            max_retries: self.max_retries.or(fallback.max_retries),
            compression_threshold: self.compression_threshold.or(fallback.compression_threshold),
        }
    }
}

/// A registered handler with its fully resolved configuration.
#[derive(Clone)]
pub struct RegisteredTask {
    pub application: String,
    pub namespace: String,
    pub taskname: String,
    pub handler: TaskHandler,
    pub processing_deadline: Duration,
    pub max_retries: u32,
    pub compression_threshold: usize,
}

impl RegisteredTask {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn call(&self, params: &TaskParameters) -> Result<(), HandlerError> {
        (self.handler)(params)
    }
}

impl fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("application", &self.application)
            .field("namespace", &self.namespace)
            .field("taskname", &self.taskname)
            .field("processing_deadline", &self.processing_deadline)
            .field("max_retries", &self.max_retries)
            .field("compression_threshold", &self.compression_threshold)
            .finish_non_exhaustive()
    }
}

/// Group of tasks sharing defaults and a route.
#[derive(Debug)]
pub struct TaskNamespace {
    name: String,
    application: String,
    defaults: TaskConfig,
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskNamespace {
    fn new(name: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            application: application.into(),
            defaults: TaskConfig::default(),
            tasks: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Defaults applied to tasks registered after this call.
    pub fn with_defaults(&mut self, defaults: TaskConfig) -> &mut Self {
        self.defaults = defaults;
        self
    }

    pub fn register<F>(
        &mut self,
        taskname: impl Into<String>,
        handler: F,
        config: TaskConfig,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&TaskParameters) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let taskname = taskname.into();
        if self.tasks.contains_key(&taskname) {
            return Err(RegistryError::DuplicateRegistration {
                namespace: self.name.clone(),
                taskname,
            });
        }

        let resolved = config.or(self.defaults);
        let task = RegisteredTask {
            application: self.application.clone(),
            namespace: self.name.clone(),
            taskname: taskname.clone(),
            handler: Arc::new(handler),
            processing_deadline: resolved
                .processing_deadline
                .unwrap_or(DEFAULT_PROCESSING_DEADLINE),
            max_retries: resolved.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            compression_threshold: resolved
                .compression_threshold
                .unwrap_or(MAX_PARAMETER_BYTES_BEFORE_COMPRESSION),
        };

        tracing::debug!(namespace = %self.name, taskname = %taskname, "Registered task");
        self.tasks.insert(taskname, task);
        Ok(self)
    }

    pub fn get(&self, taskname: &str) -> Option<&RegisteredTask> {
        self.tasks.get(taskname)
    }

    pub fn tasknames(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Build a first-attempt activation for `taskname`.
    ///
    /// Parameters are compressed when their serialized form exceeds the
    /// task's threshold, and the encoding is recorded in the headers.
    pub fn create_activation(
        &self,
        taskname: &str,
        params: &TaskParameters,
    ) -> Result<TaskActivation, TaskworkerError> {
        let task = self.tasks.get(taskname).ok_or_else(|| RegistryError::UnknownTask {
            namespace: self.name.clone(),
            taskname: taskname.to_string(),
        })?;

        let (parameters, compression) =
            compress_parameters(params.to_json()?, task.compression_threshold)?;

        let mut headers = HashMap::new();
        headers.insert(COMPRESSION_TYPE_HEADER.to_string(), compression.to_string());

        Ok(TaskActivation {
            id: Uuid::new_v4().to_string(),
            namespace: self.name.clone(),
            taskname: taskname.to_string(),
            parameters,
            headers,
            retry_state: RetryState::for_retries(task.max_retries),
            processing_deadline_duration: task.processing_deadline,
            received_at: Some(Utc::now()),
        })
    }
}

/// All namespaces known to one application.
#[derive(Debug)]
pub struct TaskRegistry {
    application: String,
    namespaces: HashMap<String, TaskNamespace>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_string(),
            namespaces: HashMap::new(),
        }
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Returns the namespace `name`, creating it on first use.
    pub fn create_namespace(&mut self, name: &str) -> &mut TaskNamespace {
        let application = self.application.clone();
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| TaskNamespace::new(name, application))
    }

    pub fn register<F>(
        &mut self,
        namespace: &str,
        taskname: impl Into<String>,
        handler: F,
        config: TaskConfig,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&TaskParameters) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.create_namespace(namespace)
            .register(taskname, handler, config)
            .map(|_| ())
    }

    pub fn namespace(&self, name: &str) -> Option<&TaskNamespace> {
        self.namespaces.get(name)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &TaskNamespace> {
        self.namespaces.values()
    }

    pub fn resolve(&self, namespace: &str, taskname: &str) -> Result<&RegisteredTask, RegistryError> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(taskname))
            .ok_or_else(|| RegistryError::UnknownTask {
                namespace: namespace.to_string(),
                taskname: taskname.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;

    fn noop(_: &TaskParameters) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry
            .register("examples", "simple_task", noop, TaskConfig::default())
            .unwrap();

        let err = registry
            .register("examples", "simple_task", noop, TaskConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateRegistration {
                namespace: "examples".into(),
                taskname: "simple_task".into(),
            }
        );

        // same taskname in a different namespace is fine
        registry
            .register("other", "simple_task", noop, TaskConfig::default())
            .unwrap();
    }

    #[test]
    fn test_resolve() {
        let mut registry = TaskRegistry::new().with_application("getsentry");
        registry
            .register("examples", "simple_task", noop, TaskConfig::default())
            .unwrap();

        let task = registry.resolve("examples", "simple_task").unwrap();
        assert_eq!(task.application, "getsentry");
        assert!(task.call(&TaskParameters::new()).is_ok());

        assert!(matches!(
            registry.resolve("examples", "missing"),
            Err(RegistryError::UnknownTask { .. })
        ));
        assert!(matches!(
            registry.resolve("missing", "simple_task"),
            Err(RegistryError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_config_precedence() {
        let mut registry = TaskRegistry::new();
        registry
            .create_namespace("examples")
            .with_defaults(TaskConfig::new().with_max_retries(2).with_compression_threshold(64))
            .register("inherits", noop, TaskConfig::default())
            .unwrap()
            .register(
                "overrides",
                noop,
                TaskConfig::new()
                    .with_max_retries(5)
                    .with_processing_deadline(Duration::from_secs(30)),
            )
            .unwrap();

        let inherits = registry.resolve("examples", "inherits").unwrap();
        assert_eq!(inherits.max_retries, 2);
        assert_eq!(inherits.max_attempts(), 3);
        assert_eq!(inherits.compression_threshold, 64);
        assert_eq!(inherits.processing_deadline, DEFAULT_PROCESSING_DEADLINE);

        let overrides = registry.resolve("examples", "overrides").unwrap();
        assert_eq!(overrides.max_retries, 5);
        assert_eq!(overrides.processing_deadline, Duration::from_secs(30));
        assert_eq!(overrides.compression_threshold, 64);
    }

    #[test]
    fn test_global_defaults() {
        let mut registry = TaskRegistry::new();
        registry
            .register("examples", "simple_task", noop, TaskConfig::default())
            .unwrap();
        let task = registry.resolve("examples", "simple_task").unwrap();
        assert_eq!(task.application, DEFAULT_APPLICATION);
        assert_eq!(task.max_attempts(), 1);
        assert_eq!(task.compression_threshold, MAX_PARAMETER_BYTES_BEFORE_COMPRESSION);
    }

    #[test]
    fn test_create_activation() {
        let mut registry = TaskRegistry::new();
        registry
            .create_namespace("examples")
            .register(
                "simple_task",
                noop,
                TaskConfig::new()
                    .with_max_retries(2)
                    .with_processing_deadline(Duration::from_secs(4)),
            )
            .unwrap();

        let ns = registry.namespace("examples").unwrap();
        let params = TaskParameters::new().with_arg(1).with_kwarg("name", "x");
        let act = ns.create_activation("simple_task", &params).unwrap();

        assert!(Uuid::parse_str(&act.id).is_ok());
        assert_eq!(act.namespace, "examples");
        assert_eq!(act.retry_state, RetryState { attempts: 0, max_attempts: 3 });
        assert_eq!(act.processing_deadline_duration, Duration::from_secs(4));
        assert_eq!(act.compression_type().unwrap(), CompressionType::Plaintext);
        assert_eq!(act.decode_parameters().unwrap(), params);
        assert!(act.received_at.is_some());

        let other = ns.create_activation("simple_task", &params).unwrap();
        assert_ne!(act.id, other.id);
    }

    #[test]
    fn test_create_activation_compresses_large_parameters() {
        let mut registry = TaskRegistry::new();
        registry
            .create_namespace("examples")
            .register("bulk", noop, TaskConfig::new().with_compression_threshold(128))
            .unwrap();

        let params = TaskParameters::new().with_arg("x".repeat(4096));
        let act = registry
            .namespace("examples")
            .unwrap()
            .create_activation("bulk", &params)
            .unwrap();

        assert_eq!(act.compression_type().unwrap(), CompressionType::Zstd);
        assert!(act.parameters.len() < 4096);
        assert_eq!(act.decode_parameters().unwrap(), params);
    }

    #[test]
    fn test_create_activation_unknown_task() {
        let mut registry = TaskRegistry::new();
        let ns = registry.create_namespace("examples");
        assert!(matches!(
            ns.create_activation("missing", &TaskParameters::new()),
            Err(TaskworkerError::Registry(RegistryError::UnknownTask { .. }))
        ));
    }
}
