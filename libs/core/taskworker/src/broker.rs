//! A `taskbroker.v1.ConsumerService` server over a [`PendingTaskStore`].
//!
//! Used to run the worker against a real gRPC endpoint on one machine and
//! by the client integration tests.

use crate::conversions::status_from_wire;
use crate::store::PendingTaskStore;
use grpc_client::ToTonicOption;
use protos::taskbroker::v1 as pb;
use protos::taskbroker::v1::consumer_service_server::{ConsumerService, ConsumerServiceServer};
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};

#[derive(Debug, Clone)]
pub struct LocalBroker {
    store: Arc<PendingTaskStore>,
    expected_authorization: Option<String>,
}

impl LocalBroker {
    pub fn new(store: Arc<PendingTaskStore>) -> Self {
        Self {
            store,
            expected_authorization: None,
        }
    }

    /// Reject calls that do not carry `authorization: Bearer <secret>`.
    pub fn with_rpc_secret(mut self, secret: Option<String>) -> Self {
        self.expected_authorization = secret
            .filter(|secret| !secret.is_empty())
            .map(|secret| format!("Bearer {secret}"));
        self
    }

    pub fn into_service(self) -> ConsumerServiceServer<Self> {
        ConsumerServiceServer::new(self)
            .accept_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Zstd)
    }

    fn authorize<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(expected) = &self.expected_authorization else {
            return Ok(());
        };
        let provided = request
            .metadata()
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        if provided == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid or missing RPC secret"))
        }
    }
}

#[tonic::async_trait]
impl ConsumerService for LocalBroker {
    async fn get_task(
        &self,
        request: Request<pb::GetTaskRequest>,
    ) -> Result<Response<pb::GetTaskResponse>, Status> {
        self.authorize(&request)?;
        let req = request.into_inner();

        let activation = self
            .store
            .pop(req.topic.as_deref())
            .ok_or_not_found("no pending activation")?;

        tracing::debug!(task_id = %activation.id, topic = ?req.topic, "Handed out activation");
        Ok(Response::new(pb::GetTaskResponse {
            task: Some(activation.into()),
        }))
    }

    async fn set_task_status(
        &self,
        request: Request<pb::SetTaskStatusRequest>,
    ) -> Result<Response<pb::SetTaskStatusResponse>, Status> {
        self.authorize(&request)?;
        let req = request.into_inner();

        let status = status_from_wire(req.status)?;
        self.store.set_status(&req.id, status)?;

        tracing::debug!(task_id = %req.id, status = %status, "Recorded status");
        Ok(Response::new(pb::SetTaskStatusResponse {}))
    }
}
