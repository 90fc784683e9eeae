//! Task activations: the unit of work handed out by the broker.

use crate::compression::{self, CompressionType};
use crate::constants::{COMPRESSION_TYPE_HEADER, DEFAULT_PROCESSING_DEADLINE};
use crate::error::{HandlerError, TaskworkerError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// `attempt` is zero-based and `max_attempts` counts every allowed attempt,
/// so the last attempt is `max_attempts - 1`.
pub fn retries_remaining(attempt: u32, max_attempts: u32) -> bool {
    attempt.saturating_add(1) < max_attempts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RetryState {
    /// First attempt of a task allowed `max_retries` retries.
    pub fn for_retries(max_retries: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    pub fn retries_remaining(&self) -> bool {
        retries_remaining(self.attempts, self.max_attempts)
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::for_retries(0)
    }
}

/// Broker-side lifecycle of an activation.
///
/// `Pending → Processing → {Complete | Retry | Failure}`; `Retry` puts a new
/// attempt back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Retry,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failure)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Complete)
                | (Processing, Retry)
                | (Processing, Failure)
                | (Retry, Pending)
        )
    }
}

/// Deserialized handler arguments: `{"args": [...], "kwargs": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index`, `None` when absent.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, HandlerError> {
        self.args
            .get(index)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(HandlerError::from)
    }

    /// Keyword argument `name`, `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        self.kwargs
            .get(name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(HandlerError::from)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, TaskworkerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, TaskworkerError> {
        serde_json::from_slice(bytes)
            .map_err(|e| TaskworkerError::serialization(format!("malformed task parameters: {e}")))
    }
}

/// One delivery of a task, as exchanged with the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskActivation {
    pub id: String,
    pub namespace: String,
    pub taskname: String,
    /// Serialized parameters, encoded as the `compression-type` header says.
    pub parameters: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub retry_state: RetryState,
    /// Zero means "not set"; see [`TaskActivation::deadline`].
    pub processing_deadline_duration: Duration,
    pub received_at: Option<DateTime<Utc>>,
}

impl TaskActivation {
    pub fn attempt(&self) -> u32 {
        self.retry_state.attempts
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_state.retries_remaining()
    }

    /// Wall-clock budget for one execution.
    pub fn deadline(&self) -> Duration {
        if self.processing_deadline_duration.is_zero() {
            DEFAULT_PROCESSING_DEADLINE
        } else {
            self.processing_deadline_duration
        }
    }

    /// Identity of this delivery: a retry is a new delivery of the same id.
    pub fn delivery_key(&self) -> String {
        format!("{}:{}", self.id, self.retry_state.attempts)
    }

    pub fn compression_type(&self) -> Result<CompressionType, TaskworkerError> {
        CompressionType::from_header(self.headers.get(COMPRESSION_TYPE_HEADER).map(String::as_str))
    }

    /// Decompressed parameter JSON.
    pub fn parameters_json(&self) -> Result<Vec<u8>, TaskworkerError> {
        compression::decompress_parameters(&self.parameters, self.compression_type()?)
    }

    pub fn decode_parameters(&self) -> Result<TaskParameters, TaskworkerError> {
        TaskParameters::from_json(&self.parameters_json()?)
    }

    /// Next attempt of this activation, as re-enqueued after `RETRY`.
    pub fn with_retry(&self) -> Self {
        Self {
            retry_state: self.retry_state.next_attempt(),
            ..self.clone()
        }
    }
}
