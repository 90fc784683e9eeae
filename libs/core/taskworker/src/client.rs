//! Broker client façade.
//!
//! [`TaskService`] is what the supervisor talks to: fetch the next pending
//! activation and report its outcome. "No work" is `Ok(None)`; connectivity
//! failures are [`TaskworkerError::Unavailable`] so the fetch loop can back
//! off and rotate hosts.

use crate::activation::{TaskActivation, TaskStatus};
use crate::constants::DEFAULT_REBALANCE_AFTER;
use crate::error::TaskworkerError;
use crate::metrics;
use crate::resilience::{CircuitBreakerConfig, HostSelector};
use async_trait::async_trait;
use grpc_client::{create_channel_lazy_with_config, AuthInterceptor, ChannelConfig};
use protos::taskbroker::v1 as pb;
use protos::taskbroker::v1::consumer_service_client::ConsumerServiceClient;
use std::collections::HashMap;
use std::sync::Mutex;
use tonic::codec::CompressionEncoding;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Next pending activation, optionally constrained to a partition or topic.
    async fn get_task(
        &self,
        partition: Option<u32>,
        topic: Option<String>,
    ) -> Result<Option<TaskActivation>, TaskworkerError>;

    /// Report the outcome of an activation. Reporting the same status twice
    /// is harmless.
    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskworkerError>;

    async fn complete_task(&self, id: &str) -> Result<(), TaskworkerError> {
        self.set_task_status(id, TaskStatus::Complete).await
    }
}

/// Publishes activations onto a topic.
#[async_trait]
pub trait TaskProducer: Send + Sync {
    async fn produce(&self, topic: &str, activation: TaskActivation) -> Result<(), TaskworkerError>;
}

type BrokerClient = ConsumerServiceClient<InterceptedService<Channel, AuthInterceptor>>;

#[derive(Debug, Clone)]
pub struct GrpcTaskServiceConfig {
    /// Only fetch activations of this namespace.
    pub namespace: Option<String>,
    /// Activations fetched over one connection before it is re-established.
    pub rebalance_after: u32,
    pub channel: ChannelConfig,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GrpcTaskServiceConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            rebalance_after: DEFAULT_REBALANCE_AFTER,
            channel: ChannelConfig::broker(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl GrpcTaskServiceConfig {
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_rebalance_after(mut self, tasks: u32) -> Self {
        self.rebalance_after = tasks.max(1);
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

struct ConnectionState {
    /// Host the next fetch goes to.
    host_index: usize,
    clients: HashMap<usize, BrokerClient>,
    tasks_fetched: u32,
    /// Host each outstanding activation was fetched from. Its status report
    /// must go back to the same broker.
    task_hosts: HashMap<String, usize>,
}

/// [`TaskService`] over the `taskbroker.v1.ConsumerService` gRPC API.
///
/// Fetches go to one host at a time. That connection is replaced after
/// `rebalance_after` fetched activations, and when its host is marked
/// unavailable after repeated connection failures. Status reports go to the
/// host that handed the activation out, whichever host is fetching now.
pub struct GrpcTaskService {
    hosts: HostSelector,
    config: GrpcTaskServiceConfig,
    auth: AuthInterceptor,
    state: Mutex<ConnectionState>,
}

impl GrpcTaskService {
    pub fn new(
        hosts: Vec<String>,
        rpc_secret: Option<String>,
        config: GrpcTaskServiceConfig,
    ) -> Result<Self, TaskworkerError> {
        if hosts.is_empty() {
            return Err(TaskworkerError::config("at least one broker host is required"));
        }
        let hosts = HostSelector::new(hosts, config.breaker);
        let host_index = hosts.next_available(None).unwrap_or(0);

        Ok(Self {
            hosts,
            config,
            auth: AuthInterceptor::from_secret(rpc_secret),
            state: Mutex::new(ConnectionState {
                host_index,
                clients: HashMap::new(),
                tasks_fetched: 0,
                task_hosts: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Host the next fetch goes to.
    pub fn current_host(&self) -> Option<String> {
        let index = self.lock().host_index;
        self.hosts.host(index).map(str::to_string)
    }

    /// Host an outstanding activation was fetched from.
    pub fn host_for_task(&self, id: &str) -> Option<String> {
        let index = self.lock().task_hosts.get(id).copied()?;
        self.hosts.host(index).map(str::to_string)
    }

    /// Client for host `index`, connecting lazily.
    fn client_for(&self, index: usize) -> Result<BrokerClient, TaskworkerError> {
        let mut state = self.lock();
        if let Some(client) = state.clients.get(&index) {
            return Ok(client.clone());
        }

        let host = self
            .hosts
            .host(index)
            .ok_or_else(|| TaskworkerError::config("broker host index out of range"))?;
        let channel = create_channel_lazy_with_config(host, self.config.channel.clone())?;
        let client = ConsumerServiceClient::with_interceptor(channel, self.auth.clone())
            .accept_compressed(CompressionEncoding::Zstd);

        tracing::info!(host = %host, "Connecting to broker");
        state.clients.insert(index, client.clone());
        Ok(client)
    }

    /// Drop the connection to `from` and fetch from the next eligible host.
    /// Reports still owed to `from` reconnect on demand.
    fn rotate(&self, from: usize) {
        let mut state = self.lock();
        state.clients.remove(&from);
        if state.host_index != from {
            // another caller already moved on
            return;
        }
        state.host_index = self.hosts.next_available(Some(from)).unwrap_or(from);
        state.tasks_fetched = 0;
    }

    fn count_fetched(&self, index: usize, id: &str) {
        let rebalance = {
            let mut state = self.lock();
            state.task_hosts.insert(id.to_string(), index);
            if state.host_index != index {
                return;
            }
            state.tasks_fetched += 1;
            state.tasks_fetched >= self.config.rebalance_after
        };
        if rebalance {
            tracing::debug!(
                rebalance_after = self.config.rebalance_after,
                "Rebalancing broker connection"
            );
            self.rotate(index);
        }
    }

    fn on_error(&self, index: usize, status: tonic::Status, rpc: &'static str) -> TaskworkerError {
        let err = TaskworkerError::from(status);
        metrics::record_rpc_error(rpc, err.is_connection_error());
        if err.is_connection_error() {
            tracing::warn!(error = %err, rpc, "Broker call failed");
            if self.hosts.record_failure(index) {
                self.rotate(index);
            }
        }
        err
    }
}

#[async_trait]
impl TaskService for GrpcTaskService {
    async fn get_task(
        &self,
        partition: Option<u32>,
        topic: Option<String>,
    ) -> Result<Option<TaskActivation>, TaskworkerError> {
        let index = self.lock().host_index;
        let mut client = self.client_for(index)?;
        let request = pb::GetTaskRequest {
            namespace: self.config.namespace.clone(),
            topic,
            partition,
        };

        match client.get_task(request).await {
            Ok(response) => {
                self.hosts.record_success(index);
                let task = response.into_inner().task.map(TaskActivation::from);
                if let Some(task) = &task {
                    self.count_fetched(index, &task.id);
                }
                Ok(task)
            }
            Err(status) if status.code() == tonic::Code::NotFound => {
                self.hosts.record_success(index);
                Ok(None)
            }
            Err(status) => Err(self.on_error(index, status, "get_task")),
        }
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskworkerError> {
        let index = {
            let state = self.lock();
            state.task_hosts.get(id).copied().unwrap_or(state.host_index)
        };
        let mut client = self.client_for(index)?;
        let request = pb::SetTaskStatusRequest {
            id: id.to_string(),
            status: pb::TaskActivationStatus::from(status) as i32,
        };

        match client.set_task_status(request).await {
            Ok(_) => {
                self.hosts.record_success(index);
                self.lock().task_hosts.remove(id);
                Ok(())
            }
            Err(status) => {
                let err = self.on_error(index, status, "set_task_status");
                // keep the owner while a retried report can still reach it
                if !err.is_connection_error() {
                    self.lock().task_hosts.remove(id);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_requires_hosts() {
        let result = GrpcTaskService::new(vec![], None, GrpcTaskServiceConfig::default());
        assert!(matches!(result, Err(TaskworkerError::Config(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = GrpcTaskServiceConfig::default();
        assert_eq!(config.rebalance_after, 32);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.timeout, Duration::from_secs(20));
        assert_eq!(config.with_rebalance_after(0).rebalance_after, 1);
    }

    #[tokio::test]
    async fn test_invalid_host_is_permanent() {
        let service =
            GrpcTaskService::new(vec!["not a uri".into()], None, GrpcTaskServiceConfig::default())
                .unwrap();
        let err = service.get_task(None, None).await.unwrap_err();
        assert!(matches!(err, TaskworkerError::Grpc(_)));
        assert!(!err.is_connection_error());
    }

    #[tokio::test]
    async fn test_rotates_after_consecutive_unavailable_errors() {
        // nothing listens on port 1
        let service = GrpcTaskService::new(
            vec!["http://127.0.0.1:1".into(), "http://127.0.0.2:1".into()],
            None,
            GrpcTaskServiceConfig::default(),
        )
        .unwrap();
        assert_eq!(service.current_host().as_deref(), Some("http://127.0.0.1:1"));

        for _ in 0..2 {
            let err = service.get_task(None, None).await.unwrap_err();
            assert!(err.is_connection_error());
            assert_eq!(service.current_host().as_deref(), Some("http://127.0.0.1:1"));
        }

        let err = service.get_task(None, None).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(service.current_host().as_deref(), Some("http://127.0.0.2:1"));
    }

    #[tokio::test]
    async fn test_mock_complete_task() {
        let mut mock = MockTaskService::new();
        mock.expect_complete_task()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| Ok(()));
        mock.complete_task("abc").await.unwrap();
    }
}
