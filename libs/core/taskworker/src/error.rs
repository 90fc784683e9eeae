//! Error types and error categorization
//!
//! Errors are categorized to determine retry behavior:
//! - **Transient**: temporary failure, retry (with backoff when talking to the broker)
//! - **Permanent**: retrying cannot help, the activation fails immediately

use crate::constants::MAX_BACKOFF_SECONDS_WHEN_HOST_UNAVAILABLE;
use std::time::Duration;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    /// Exponential backoff `min(2^n, 20)` seconds for the n-th consecutive
    /// transient error. Permanent errors are not retried.
    pub fn backoff_delay(&self, consecutive_errors: u32) -> Duration {
        match self {
            ErrorCategory::Permanent => Duration::ZERO,
            ErrorCategory::Transient => {
                let secs = 2u64
                    .saturating_pow(consecutive_errors)
                    .min(MAX_BACKOFF_SECONDS_WHEN_HOST_UNAVAILABLE);
                Duration::from_secs(secs)
            }
        }
    }
}

/// Registration and lookup failures in the task registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task '{namespace}:{taskname}' is already registered")]
    DuplicateRegistration { namespace: String, taskname: String },

    #[error("unknown task '{namespace}:{taskname}'")]
    UnknownTask { namespace: String, taskname: String },
}

/// Runtime errors
#[derive(Error, Debug)]
pub enum TaskworkerError {
    /// The broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker answered with an error status
    #[error("broker error ({code}): {message}")]
    Rpc { code: tonic::Code, message: String },

    /// Malformed parameters or unknown compression
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown activation '{0}'")]
    UnknownActivation(String),

    #[error("activation '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: crate::activation::TaskStatus,
        to: crate::activation::TaskStatus,
    },

    #[error(transparent)]
    Grpc(#[from] grpc_client::GrpcError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Spawning or talking to a child executor failed
    #[error("child process error: {0}")]
    Child(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskworkerError {
    pub fn serialization(message: impl Into<String>) -> Self {
        TaskworkerError::Serialization(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        TaskworkerError::Config(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskworkerError::Unavailable(_)
            | TaskworkerError::Redis(_)
            | TaskworkerError::Child(_)
            | TaskworkerError::Io(_) => ErrorCategory::Transient,
            TaskworkerError::Rpc { code, .. } => match code {
                tonic::Code::ResourceExhausted | tonic::Code::Aborted | tonic::Code::Internal => {
                    ErrorCategory::Transient
                }
                _ => ErrorCategory::Permanent,
            },
            TaskworkerError::Serialization(_)
            | TaskworkerError::Registry(_)
            | TaskworkerError::Config(_)
            | TaskworkerError::UnknownActivation(_)
            | TaskworkerError::InvalidTransition { .. }
            | TaskworkerError::Grpc(_) => ErrorCategory::Permanent,
        }
    }

    /// Broker connectivity failure, distinct from "no work" and from
    /// application errors returned by a reachable broker.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TaskworkerError::Unavailable(_))
    }
}

impl From<tonic::Status> for TaskworkerError {
    fn from(status: tonic::Status) -> Self {
        if grpc_client::is_connection_error(&status) {
            TaskworkerError::Unavailable(status.message().to_string())
        } else {
            TaskworkerError::Rpc {
                code: status.code(),
                message: status.message().to_string(),
            }
        }
    }
}

impl From<TaskworkerError> for tonic::Status {
    fn from(err: TaskworkerError) -> Self {
        match &err {
            TaskworkerError::UnknownActivation(_) => tonic::Status::not_found(err.to_string()),
            TaskworkerError::InvalidTransition { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            TaskworkerError::Serialization(_) | TaskworkerError::Config(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            TaskworkerError::Rpc { code, message } => tonic::Status::new(*code, message.clone()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TaskworkerError {
    fn from(err: serde_json::Error) -> Self {
        TaskworkerError::Serialization(err.to_string())
    }
}

/// Error returned by a task handler
///
/// Retryable failures become `RETRY` while attempts remain; permanent ones
/// become `FAILURE` straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub category: ErrorCategory,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Transient
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::retryable(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::retryable(message)
    }
}

/// Bad arguments never improve on retry.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::permanent(format!("invalid task parameters: {err}"))
    }
}
