//! Supervisor fetch loop.
//!
//! One task pulls activations from the broker and feeds a bounded queue; a
//! fixed set of [`WorkerSlot`]s drains it, each through its own child
//! executor. A queue slot is reserved *before* fetching, so the loop never
//! holds an activation it cannot hand off.

use crate::activation::TaskActivation;
use crate::app::WorkerApp;
use crate::client::TaskService;
use crate::constants::{
    DEFAULT_CHILD_TASK_COUNT, DEFAULT_EMPTY_POLL_INTERVAL, DEFAULT_STATUS_REPORT_ATTEMPTS,
    DEFAULT_WORKER_QUEUE_SIZE,
};
use crate::error::{ErrorCategory, TaskworkerError};
use crate::health::HealthCheckFile;
use crate::metrics;
use crate::pool::{ChildSpawner, SharedQueue, SlotConfig, WorkerSlot};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker slots, each with one child process.
    pub concurrency: usize,
    pub queue_size: usize,
    /// Namespace whose route decides the fetch topic. `None` fetches from
    /// the default topic.
    pub namespace: Option<String>,
    pub partition: Option<u32>,
    pub max_child_task_count: u64,
    pub report_attempts: u32,
    pub poll_interval: Duration,
    pub health_check_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_size: DEFAULT_WORKER_QUEUE_SIZE,
            namespace: None,
            partition: None,
            max_child_task_count: DEFAULT_CHILD_TASK_COUNT,
            report_attempts: DEFAULT_STATUS_REPORT_ATTEMPTS,
            poll_interval: DEFAULT_EMPTY_POLL_INTERVAL,
            health_check_file: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_partition(mut self, partition: Option<u32>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_max_child_task_count(mut self, count: u64) -> Self {
        self.max_child_task_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_health_check_file(mut self, path: Option<PathBuf>) -> Self {
        self.health_check_file = path;
        self
    }

    fn slot_config(&self) -> SlotConfig {
        SlotConfig {
            max_child_task_count: self.max_child_task_count.max(1),
            report_attempts: self.report_attempts,
        }
    }
}

/// Counters for one run of the fetch loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub fetched: u64,
    pub dispatched: u64,
    pub skipped_duplicates: u64,
    pub fetch_errors: u64,
}

pub struct TaskWorker {
    app: Arc<WorkerApp>,
    service: Arc<dyn TaskService>,
    spawner: Arc<dyn ChildSpawner>,
    config: WorkerConfig,
    ready: Arc<AtomicBool>,
}

impl TaskWorker {
    pub fn new(
        app: Arc<WorkerApp>,
        service: Arc<dyn TaskService>,
        spawner: Arc<dyn ChildSpawner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            app,
            service,
            spawner,
            config,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a readiness flag with the health endpoints.
    pub fn with_readiness(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = ready;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn fetch_topic(&self) -> String {
        match &self.config.namespace {
            Some(namespace) => self.app.router().route_namespace(namespace),
            None => self.app.router().default_topic().to_string(),
        }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// On shutdown the queue is closed; slots finish what was already
    /// dispatched, report it and stop their children before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, TaskworkerError> {
        let concurrency = self.config.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<TaskActivation>(self.config.queue_size.max(1));
        let queue: SharedQueue = Arc::new(Mutex::new(rx));

        let health = self
            .config
            .health_check_file
            .clone()
            .map(|path| Arc::new(HealthCheckFile::new(path)));

        let mut slots = JoinSet::new();
        for index in 0..concurrency {
            let slot = WorkerSlot::new(
                index,
                queue.clone(),
                self.service.clone(),
                self.spawner.clone(),
                self.config.slot_config(),
            )
            .with_health_check_file(health.clone());
            slots.spawn(slot.run());
        }

        info!(
            concurrency,
            queue_size = tx.max_capacity(),
            namespace = ?self.config.namespace,
            partition = ?self.config.partition,
            "Starting taskworker"
        );

        let mut stats = WorkerStats::default();
        let mut consecutive_errors: u32 = 0;
        self.ready.store(true, Ordering::SeqCst);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("All worker slots exited, stopping fetch loop");
                        break;
                    }
                },
            };

            let topic = self.fetch_topic();
            let fetched = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = self.service.get_task(self.config.partition, Some(topic.clone())) => result,
            };

            match fetched {
                Ok(Some(activation)) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Broker connection recovered");
                        consecutive_errors = 0;
                    }
                    touch_health(health.as_deref()).await;
                    stats.fetched += 1;

                    if !self.app.should_attempt_at_most_once(&activation).await {
                        debug!(task_id = %activation.id, attempt = activation.attempt(), "At-most-once check declined delivery");
                        metrics::record_dedup_skip(&activation.namespace);
                        stats.skipped_duplicates += 1;
                        continue;
                    }

                    debug!(
                        task_id = %activation.id,
                        namespace = %activation.namespace,
                        taskname = %activation.taskname,
                        topic = %topic,
                        "Dispatching activation"
                    );
                    permit.send(activation);
                    stats.dispatched += 1;
                    metrics::set_queue_depth(tx.max_capacity() - tx.capacity());
                }
                Ok(None) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Broker connection recovered");
                        consecutive_errors = 0;
                    }
                    touch_health(health.as_deref()).await;
                    drop(permit);
                    if sleep_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    stats.fetch_errors += 1;
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = ErrorCategory::Transient.backoff_delay(consecutive_errors);
                    match e.category() {
                        ErrorCategory::Transient => {
                            warn!(error = %e, consecutive_errors, ?delay, topic = %topic, "Fetch failed, backing off")
                        }
                        ErrorCategory::Permanent => {
                            error!(error = %e, consecutive_errors, ?delay, topic = %topic, "Broker rejected fetch")
                        }
                    }
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        info!("Shutdown requested, draining worker slots");
        self.ready.store(false, Ordering::SeqCst);
        drop(tx);

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot panicked");
            }
        }
        metrics::set_queue_depth(0);

        info!(
            fetched = stats.fetched,
            dispatched = stats.dispatched,
            skipped = stats.skipped_duplicates,
            "Taskworker stopped"
        );
        Ok(stats)
    }
}

async fn touch_health(health: Option<&HealthCheckFile>) {
    if let Some(file) = health {
        file.touch().await;
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Returns `true` when shutdown arrived before the delay elapsed.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{TaskParameters, TaskStatus};
    use crate::client::MockTaskService;
    use crate::error::HandlerError;
    use crate::pool::InProcessSpawner;
    use crate::registry::{TaskConfig, TaskRegistry};
    use crate::router::{InMemoryOptions, Router, SiloMode};
    use crate::store::InMemoryTaskService;
    use crate::testing::activation;
    use std::sync::atomic::AtomicUsize;

    fn counting_registry(calls: Arc<AtomicUsize>) -> TaskRegistry {
        let failures = calls.clone();
        let mut registry = TaskRegistry::new();
        registry
            .create_namespace("examples")
            .register(
                "simple_task",
                move |_| {
                    failures.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::from("simple_task always fails"))
                },
                TaskConfig::default(),
            )
            .unwrap()
            .register(
                "will_retry",
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::from("try again"))
                },
                TaskConfig::default().with_max_retries(2),
            )
            .unwrap()
            .register(
                "slow_ok",
                |_| {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(())
                },
                TaskConfig::default(),
            )
            .unwrap();
        registry
    }

    fn worker(registry: TaskRegistry, service: Arc<dyn TaskService>, config: WorkerConfig) -> TaskWorker {
        let router = Router::new(None, SiloMode::Monolith, Arc::new(InMemoryOptions::new()));
        let app = Arc::new(WorkerApp::new(registry, router));
        let spawner = Arc::new(InProcessSpawner::new(app.registry().clone()));
        TaskWorker::new(app, service, spawner, config)
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_executes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reports = Arc::new(AtomicUsize::new(0));

        let fetches = Arc::new(AtomicUsize::new(0));
        let mut service = MockTaskService::new();
        let counter = fetches.clone();
        service.expect_get_task().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Some(activation("abc", 0, 1)))
            } else {
                Ok(None)
            }
        });
        let reported = reports.clone();
        service
            .expect_set_task_status()
            .withf(|id, status| id == "abc" && *status == TaskStatus::Failure)
            .times(1)
            .returning(move |_, _| {
                reported.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let worker = worker(counting_registry(calls.clone()), Arc::new(service), fast_config());
        let (stop, shutdown) = watch::channel(false);
        let stopper = async {
            wait_until(|| reports.load(Ordering::SeqCst) == 1 && fetches.load(Ordering::SeqCst) > 2).await;
            stop.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        let stats = stats.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn test_single_attempt_failure_is_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = InMemoryTaskService::default();
        service.store().push(crate::constants::DEFAULT_TOPIC, activation("abc", 0, 1));

        let store = service.store().clone();
        let worker = worker(counting_registry(calls.clone()), Arc::new(service), fast_config());
        let (stop, shutdown) = watch::channel(false);
        let stopper = async {
            wait_until(|| store.counts().outstanding() == 0).await;
            stop.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        assert_eq!(stats.unwrap().dispatched, 1);
        assert_eq!(store.status_of("abc"), Some(TaskStatus::Failure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(crate::state::current(), None);
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone());
        let service = InMemoryTaskService::default();
        let store = service.store().clone();

        let router = Router::new(None, SiloMode::Monolith, Arc::new(InMemoryOptions::new()));
        let app = Arc::new(WorkerApp::new(registry, router));
        let id = app
            .send_task(&service, "examples", "will_retry", &TaskParameters::new())
            .await
            .unwrap();

        let spawner = Arc::new(InProcessSpawner::new(app.registry().clone()));
        let worker = TaskWorker::new(app, Arc::new(service), spawner, fast_config());
        let (stop, shutdown) = watch::channel(false);
        let stopper = async {
            wait_until(|| store.counts().outstanding() == 0).await;
            stop.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        assert_eq!(stats.unwrap().dispatched, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.status_of(&id), Some(TaskStatus::Failure));
        assert_eq!(store.activation(&id).unwrap().attempt(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_activations_bounded_by_queue() {
        let service = InMemoryTaskService::default();
        let store = service.store().clone();
        for i in 0..20 {
            let mut act = activation(&format!("t{i}"), 0, 1);
            act.taskname = "slow_ok".to_string();
            store.push(crate::constants::DEFAULT_TOPIC, act);
        }

        let config = fast_config().with_concurrency(1).with_queue_size(2);
        let worker = worker(counting_registry(Arc::new(AtomicUsize::new(0))), Arc::new(service), config);
        let (stop, shutdown) = watch::channel(false);
        let mut max_processing = 0;
        let stopper = async {
            wait_until(|| {
                let counts = store.counts();
                max_processing = max_processing.max(counts.processing);
                counts.outstanding() == 0
            })
            .await;
            stop.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        assert_eq!(stats.unwrap().dispatched, 20);
        assert_eq!(store.counts().complete, 20);
        // two queued plus one executing
        assert!(max_processing <= 3, "max in flight was {max_processing}");
    }

    #[tokio::test]
    async fn test_fetch_errors_back_off_until_shutdown() {
        let mut service = MockTaskService::new();
        service
            .expect_get_task()
            .times(1)
            .returning(|_, _| Err(TaskworkerError::Unavailable("connection refused".into())));

        let health = std::env::temp_dir().join(format!("taskworker-worker-{}", uuid::Uuid::new_v4()));
        let config = fast_config().with_health_check_file(Some(health.clone()));
        let ready = Arc::new(AtomicBool::new(false));
        let worker = worker(TaskRegistry::new(), Arc::new(service), config).with_readiness(ready.clone());

        let (stop, shutdown) = watch::channel(false);
        let stopper = async {
            wait_until(|| ready.load(Ordering::SeqCst)).await;
            // the first backoff is 2s, shutdown must cut it short
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.send(true).unwrap();
        };
        let started = std::time::Instant::now();
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        assert_eq!(stats.unwrap().fetch_errors, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!ready.load(Ordering::SeqCst));
        assert!(!health.exists());
    }

    #[tokio::test]
    async fn test_successful_fetch_touches_health_file() {
        let mut service = MockTaskService::new();
        service.expect_get_task().returning(|_, _| Ok(None));

        let health = std::env::temp_dir().join(format!("taskworker-worker-{}", uuid::Uuid::new_v4()));
        let config = fast_config().with_health_check_file(Some(health.clone()));
        let worker = worker(TaskRegistry::new(), Arc::new(service), config);

        let (stop, shutdown) = watch::channel(false);
        let watched = health.clone();
        let stopper = async {
            wait_until(|| watched.exists()).await;
            stop.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(worker.run(shutdown), stopper);

        assert_eq!(stats.unwrap().dispatched, 0);
        tokio::fs::remove_file(&health).await.unwrap();
    }

    #[test]
    fn test_topic_follows_namespace_route() {
        let options = Arc::new(InMemoryOptions::new());
        let router = Router::new(Some(r#"{"examples": "examples-topic"}"#), SiloMode::Control, options);
        let app = Arc::new(WorkerApp::new(TaskRegistry::new(), router));
        let spawner = Arc::new(InProcessSpawner::new(app.registry().clone()));
        let service: Arc<dyn TaskService> = Arc::new(InMemoryTaskService::default());

        let scoped = TaskWorker::new(
            app.clone(),
            service.clone(),
            spawner.clone(),
            WorkerConfig::default().with_namespace(Some("examples".into())),
        );
        assert_eq!(scoped.fetch_topic(), "examples-topic");

        let unscoped = TaskWorker::new(app, service, spawner, WorkerConfig::default());
        assert_eq!(unscoped.fetch_topic(), "taskworker-control");
    }
}
