//! Taskworker Runtime
//!
//! Pulls task activations from a broker, executes them in isolated child
//! processes and reports the outcome back.
//!
//! ## Features
//!
//! - **Task registry**: namespaced handlers with per-task deadline, retry and
//!   compression settings
//! - **Routing**: namespace → topic with dynamic overrides polled from Redis
//! - **At-most-once delivery**: duplicate deliveries are skipped, in memory or
//!   across supervisors through Redis
//! - **Process isolation**: one child process per worker slot, killed and
//!   replaced on deadline overrun or crash, recycled after a task count
//! - **Broker client**: gRPC with host rotation, rebalancing and backoff
//! - **Prometheus metrics** and K8s-style health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use taskworker::{TaskConfig, TaskRegistry, TaskWorker, WorkerApp, WorkerConfig};
//!
//! let mut registry = TaskRegistry::new();
//! registry
//!     .create_namespace("examples")
//!     .register("say_hello", |params| { /* ... */ Ok(()) }, TaskConfig::default())?;
//!
//! let app = Arc::new(WorkerApp::new(registry, router));
//! let worker = TaskWorker::new(app, service, spawner, WorkerConfig::default());
//! worker.run(shutdown_rx).await?;
//! ```

pub mod activation;
pub mod app;
pub mod broker;
pub mod child;
pub mod client;
pub mod compression;
pub mod constants;
pub mod conversions;
pub mod dedup;
mod error;
pub mod health;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod state;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use activation::{RetryState, TaskActivation, TaskParameters, TaskStatus};
pub use app::{WorkerApp, WorkerAppConfig};
pub use broker::LocalBroker;
pub use client::{GrpcTaskService, GrpcTaskServiceConfig, TaskProducer, TaskService};
pub use compression::CompressionType;
pub use dedup::{connect_redis, AtMostOnceStore, InMemoryAtMostOnceStore, RedisAtMostOnceStore};
pub use error::{ErrorCategory, HandlerError, RegistryError, TaskworkerError};
pub use health::{health_router, HealthCheckFile, HealthState};
pub use metrics::init_metrics;
pub use options::{OptionsSource, PolledOptions, RedisOptionsSource};
pub use pool::{ChildSpawner, InProcessSpawner, ProcessSpawner};
pub use registry::{TaskConfig, TaskHandler, TaskNamespace, TaskRegistry};
pub use router::{InMemoryOptions, OptionsStore, Router, SiloMode};
pub use store::{InMemoryTaskService, PendingTaskStore};
pub use worker::{TaskWorker, WorkerConfig, WorkerStats};
