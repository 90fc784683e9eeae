//! Conversions between `taskbroker.v1` wire messages and domain types.

use crate::activation::{RetryState, TaskActivation, TaskStatus};
use grpc_client::conversions::{
    duration_to_secs, millis_to_datetime, opt_datetime_to_millis, secs_to_duration,
};
use protos::taskbroker::v1 as pb;
use std::time::Duration;

impl From<pb::RetryState> for RetryState {
    fn from(state: pb::RetryState) -> Self {
        Self {
            attempts: state.attempts,
            max_attempts: state.max_attempts,
        }
    }
}

impl From<RetryState> for pb::RetryState {
    fn from(state: RetryState) -> Self {
        Self {
            attempts: state.attempts,
            max_attempts: state.max_attempts,
        }
    }
}

impl From<pb::TaskActivation> for TaskActivation {
    fn from(msg: pb::TaskActivation) -> Self {
        Self {
            id: msg.id,
            namespace: msg.namespace,
            taskname: msg.taskname,
            parameters: msg.parameters,
            headers: msg.headers,
            // a broker that omits retry state allows exactly one attempt
            retry_state: msg.retry_state.map(RetryState::from).unwrap_or_default(),
            processing_deadline_duration: secs_to_duration(msg.processing_deadline_duration)
                .unwrap_or(Duration::ZERO),
            received_at: millis_to_datetime(msg.received_at_ms),
        }
    }
}

impl From<TaskActivation> for pb::TaskActivation {
    fn from(activation: TaskActivation) -> Self {
        Self {
            id: activation.id,
            namespace: activation.namespace,
            taskname: activation.taskname,
            parameters: activation.parameters,
            headers: activation.headers,
            retry_state: Some(activation.retry_state.into()),
            processing_deadline_duration: duration_to_secs(activation.processing_deadline_duration),
            received_at_ms: opt_datetime_to_millis(activation.received_at),
        }
    }
}

impl From<TaskStatus> for pb::TaskActivationStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => pb::TaskActivationStatus::Pending,
            TaskStatus::Processing => pb::TaskActivationStatus::Processing,
            TaskStatus::Complete => pb::TaskActivationStatus::Complete,
            TaskStatus::Retry => pb::TaskActivationStatus::Retry,
            TaskStatus::Failure => pb::TaskActivationStatus::Failure,
        }
    }
}

impl TryFrom<pb::TaskActivationStatus> for TaskStatus {
    type Error = crate::error::TaskworkerError;

    fn try_from(status: pb::TaskActivationStatus) -> Result<Self, Self::Error> {
        match status {
            pb::TaskActivationStatus::Pending => Ok(TaskStatus::Pending),
            pb::TaskActivationStatus::Processing => Ok(TaskStatus::Processing),
            pb::TaskActivationStatus::Complete => Ok(TaskStatus::Complete),
            pb::TaskActivationStatus::Retry => Ok(TaskStatus::Retry),
            pb::TaskActivationStatus::Failure => Ok(TaskStatus::Failure),
            pb::TaskActivationStatus::Unspecified => Err(
                crate::error::TaskworkerError::serialization("activation status is unspecified"),
            ),
        }
    }
}

/// Decode the raw `status` field of a `SetTaskStatusRequest`.
pub fn status_from_wire(raw: i32) -> Result<TaskStatus, crate::error::TaskworkerError> {
    pb::TaskActivationStatus::try_from(raw)
        .map_err(|_| {
            crate::error::TaskworkerError::serialization(format!("unknown activation status {raw}"))
        })
        .and_then(TaskStatus::try_from)
}
