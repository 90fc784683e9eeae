//! Worker slots and the child executors they own.
//!
//! Each slot pulls activations off the shared bounded queue, runs them in
//! its own child executor, and reports the outcome to the broker.
//!
//! Per-slot state machine:
//!
//! ```text
//! IDLE -> FETCHING -> EXECUTING -> REPORTING -> IDLE
//!                     EXECUTING -> TIMED_OUT -> REPORTING -> IDLE
//! ```
//!
//! A child that overruns the deadline or dies is killed and replaced; a
//! child that has executed `max_child_task_count` activations is shut down
//! and replaced before the next one.

use crate::activation::{TaskActivation, TaskStatus};
use crate::child::{serve_child, ChildRequest, ChildResponse, ExecutionOutcome};
use crate::client::TaskService;
use crate::constants::{CHILD_SHUTDOWN_GRACE, DEFAULT_CHILD_TASK_COUNT, DEFAULT_STATUS_REPORT_ATTEMPTS};
use crate::error::{ErrorCategory, TaskworkerError};
use crate::health::HealthCheckFile;
use crate::metrics;
use crate::registry::TaskRegistry;
use crate::state::CurrentTaskState;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ChildError {
    #[error("execution exceeded its {0:?} deadline")]
    TimedOut(Duration),

    #[error("child executor died: {0}")]
    Crashed(String),

    #[error("child protocol violation: {0}")]
    Protocol(String),
}

/// Map an execution outcome to the status reported to the broker.
pub fn status_for_outcome(outcome: &ExecutionOutcome, retries_remaining: bool) -> TaskStatus {
    match outcome {
        ExecutionOutcome::Complete => TaskStatus::Complete,
        ExecutionOutcome::Failed { retryable: true, .. } if retries_remaining => TaskStatus::Retry,
        ExecutionOutcome::Failed { .. } => TaskStatus::Failure,
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Supervisor end of one child executor.
pub struct ChildHandle {
    writer: BoxedWriter,
    reader: Lines<BufReader<BoxedReader>>,
    process: Option<Child>,
    server: Option<JoinHandle<()>>,
    tasks_executed: u64,
}

impl ChildHandle {
    fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        process: Option<Child>,
        server: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            writer,
            reader: BufReader::new(reader).lines(),
            process,
            server,
            tasks_executed: 0,
        }
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Send one request and wait for its answer, at most `deadline`.
    pub async fn execute(
        &mut self,
        request: &ChildRequest,
        deadline: Duration,
    ) -> Result<ExecutionOutcome, ChildError> {
        let mut line = serde_json::to_vec(request).map_err(|e| ChildError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let exchange = async {
            self.writer
                .write_all(&line)
                .await
                .map_err(|e| ChildError::Crashed(e.to_string()))?;
            self.writer
                .flush()
                .await
                .map_err(|e| ChildError::Crashed(e.to_string()))?;

            match self.reader.next_line().await {
                Ok(Some(reply)) => serde_json::from_str::<ChildResponse>(&reply)
                    .map_err(|e| ChildError::Protocol(format!("unparseable reply: {e}"))),
                Ok(None) => Err(ChildError::Crashed("child closed its output".to_string())),
                Err(e) => Err(ChildError::Crashed(e.to_string())),
            }
        };

        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| ChildError::TimedOut(deadline))??;

        if response.id != request.state.id {
            return Err(ChildError::Protocol(format!(
                "reply for '{}' while waiting for '{}'",
                response.id, request.state.id
            )));
        }
        self.tasks_executed += 1;
        Ok(response.outcome)
    }

    /// Close the child's pipes and let it exit, killing it after a grace period.
    pub async fn shutdown(self) {
        let ChildHandle {
            writer,
            reader,
            process,
            server,
            ..
        } = self;
        // both halves must go for an in-process child to see EOF
        drop(writer);
        drop(reader);

        if let Some(mut process) = process {
            match tokio::time::timeout(CHILD_SHUTDOWN_GRACE, process.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Child executor exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for child executor"),
                Err(_) => {
                    tracing::warn!("Child executor ignored shutdown, killing");
                    let _ = process.kill().await;
                }
            }
        }
        if let Some(mut server) = server {
            if tokio::time::timeout(CHILD_SHUTDOWN_GRACE, &mut server).await.is_err() {
                tracing::warn!("In-process child ignored shutdown, aborting");
                server.abort();
            }
        }
    }

    /// Terminate the child immediately.
    pub async fn kill(self) {
        if let Some(mut process) = self.process {
            if let Err(e) = process.kill().await {
                tracing::warn!(error = %e, "Failed to kill child executor");
            }
        }
        if let Some(server) = self.server {
            server.abort();
        }
    }
}

#[async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn(&self) -> Result<ChildHandle, TaskworkerError>;
}

/// Starts children as OS processes speaking the protocol over stdio.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> Result<Self, TaskworkerError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ChildSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<ChildHandle, TaskworkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaskworkerError::Child(format!("failed to start {}: {e}", self.program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TaskworkerError::Child("child stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskworkerError::Child("child stdout was not captured".to_string()))?;

        tracing::debug!(pid = ?child.id(), "Spawned child executor");
        Ok(ChildHandle::new(Box::new(stdout), Box::new(stdin), Some(child), None))
    }
}

/// Runs the child protocol on a task of the current runtime.
///
/// Handlers share the supervisor's address space, and a killed child's
/// handler thread runs to completion in the background. Meant for tests and
/// local development.
#[derive(Debug, Clone)]
pub struct InProcessSpawner {
    registry: Arc<TaskRegistry>,
}

impl InProcessSpawner {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChildSpawner for InProcessSpawner {
    async fn spawn(&self) -> Result<ChildHandle, TaskworkerError> {
        let (supervisor_end, child_end) = tokio::io::duplex(64 * 1024);
        let (child_read, child_write) = tokio::io::split(child_end);

        let registry = self.registry.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = serve_child(registry, BufReader::new(child_read), child_write).await {
                tracing::debug!(error = %e, "In-process child stopped");
            }
        });

        let (read, write) = tokio::io::split(supervisor_end);
        Ok(ChildHandle::new(Box::new(read), Box::new(write), None, Some(server)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SlotState {
    Idle,
    Fetching,
    Executing,
    TimedOut,
    Reporting,
}

/// Settings shared by every slot of a pool.
#[derive(Debug, Clone, Copy)]
pub struct SlotConfig {
    pub max_child_task_count: u64,
    pub report_attempts: u32,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_child_task_count: DEFAULT_CHILD_TASK_COUNT,
            report_attempts: DEFAULT_STATUS_REPORT_ATTEMPTS,
        }
    }
}

pub type SharedQueue = Arc<Mutex<mpsc::Receiver<TaskActivation>>>;

pub struct WorkerSlot {
    index: usize,
    queue: SharedQueue,
    service: Arc<dyn TaskService>,
    spawner: Arc<dyn ChildSpawner>,
    config: SlotConfig,
    health: Option<Arc<HealthCheckFile>>,
    child: Option<ChildHandle>,
    spawn_reason: &'static str,
    state: SlotState,
}

impl WorkerSlot {
    pub fn new(
        index: usize,
        queue: SharedQueue,
        service: Arc<dyn TaskService>,
        spawner: Arc<dyn ChildSpawner>,
        config: SlotConfig,
    ) -> Self {
        Self {
            index,
            queue,
            service,
            spawner,
            config,
            health: None,
            child: None,
            spawn_reason: "initial",
            state: SlotState::Idle,
        }
    }

    /// Touch `health` after every status report the broker accepts.
    pub fn with_health_check_file(mut self, health: Option<Arc<HealthCheckFile>>) -> Self {
        self.health = health;
        self
    }

    fn transition(&mut self, next: SlotState) {
        tracing::trace!(slot = self.index, from = %self.state, to = %next, "Slot transition");
        self.state = next;
    }

    /// Process activations until the queue is closed and drained.
    pub async fn run(mut self) {
        loop {
            self.transition(SlotState::Fetching);
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(activation) = next else {
                break;
            };
            self.process(activation).await;
            self.transition(SlotState::Idle);
        }

        if let Some(child) = self.child.take() {
            child.shutdown().await;
        }
        tracing::debug!(slot = self.index, "Worker slot stopped");
    }

    async fn process(&mut self, activation: TaskActivation) {
        let started = Instant::now();
        self.transition(SlotState::Executing);
        let status = self.execute(&activation).await;

        self.transition(SlotState::Reporting);
        let reported = report_status(
            self.service.as_ref(),
            self.config.report_attempts,
            &activation,
            status,
        )
        .await;
        if reported {
            if let Some(health) = &self.health {
                health.touch().await;
            }
        }
        metrics::record_execution(
            &activation.namespace,
            &activation.taskname,
            status,
            started.elapsed(),
        );
    }

    async fn execute(&mut self, activation: &TaskActivation) -> TaskStatus {
        let retries_remaining = activation.retries_remaining();

        // malformed input never improves on retry
        let parameters = match activation.decode_parameters() {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::warn!(task_id = %activation.id, error = %e, "Undecodable activation");
                return TaskStatus::Failure;
            }
        };
        let request = ChildRequest {
            state: CurrentTaskState::from_activation(activation),
            parameters,
        };

        let child = match self.ensure_child().await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(slot = self.index, error = %e, "Could not start child executor");
                return status_for_outcome(&ExecutionOutcome::retryable(e.to_string()), retries_remaining);
            }
        };

        let deadline = activation.deadline();
        let result = child.execute(&request, deadline).await;
        match result {
            Ok(outcome) => {
                if let ExecutionOutcome::Failed { error, retryable } = &outcome {
                    tracing::info!(
                        task_id = %activation.id,
                        taskname = %activation.taskname,
                        attempt = activation.attempt(),
                        retryable,
                        error = %error,
                        "Task failed"
                    );
                }
                self.recycle_if_due().await;
                status_for_outcome(&outcome, retries_remaining)
            }
            Err(e) => {
                if matches!(e, ChildError::TimedOut(_)) {
                    self.transition(SlotState::TimedOut);
                }
                let reason = match e {
                    ChildError::TimedOut(_) => "timeout",
                    _ => "crash",
                };
                tracing::warn!(
                    slot = self.index,
                    task_id = %activation.id,
                    deadline = ?deadline,
                    error = %e,
                    "Replacing child executor"
                );
                if let Some(child) = self.child.take() {
                    child.kill().await;
                }
                self.spawn_reason = reason;
                status_for_outcome(&ExecutionOutcome::retryable(e.to_string()), retries_remaining)
            }
        }
    }

    async fn ensure_child(&mut self) -> Result<&mut ChildHandle, TaskworkerError> {
        if self.child.is_none() {
            let child = self.spawner.spawn().await?;
            metrics::record_child_spawn(self.spawn_reason);
            tracing::debug!(slot = self.index, reason = self.spawn_reason, pid = ?child.pid(), "Child executor ready");
            self.child = Some(child);
        }
        self.child
            .as_mut()
            .ok_or_else(|| TaskworkerError::Child("no child executor".to_string()))
    }

    async fn recycle_if_due(&mut self) {
        let due = self
            .child
            .as_ref()
            .is_some_and(|child| child.tasks_executed() >= self.config.max_child_task_count);
        if !due {
            return;
        }
        if let Some(child) = self.child.take() {
            tracing::info!(
                slot = self.index,
                tasks = child.tasks_executed(),
                "Recycling child executor"
            );
            child.shutdown().await;
            self.spawn_reason = "recycle";
        }
    }
}

/// Deliver one status report, retrying transient failures with backoff.
/// Returns whether the broker accepted it.
async fn report_status(
    service: &dyn TaskService,
    attempts: u32,
    activation: &TaskActivation,
    status: TaskStatus,
) -> bool {
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        match service.set_task_status(&activation.id, status).await {
            Ok(()) => {
                tracing::debug!(task_id = %activation.id, status = %status, "Reported status");
                return true;
            }
            Err(e) if e.category() == ErrorCategory::Transient && attempt + 1 < attempts => {
                let delay = ErrorCategory::Transient.backoff_delay(attempt);
                tracing::warn!(task_id = %activation.id, error = %e, ?delay, "Status report failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(task_id = %activation.id, status = %status, error = %e, "Dropping status report");
                return false;
            }
        }
    }
    false
}
