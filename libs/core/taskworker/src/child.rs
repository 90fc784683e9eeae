//! Child executor protocol.
//!
//! A child process reads one JSON request per line on stdin, runs the
//! handler with the current-task slot set, and answers with one JSON line
//! on stdout. Logs go to stderr so stdout stays a clean protocol channel.
//!
//! ```text
//! supervisor ──{"state":{...},"parameters":{...}}──▶ child
//! supervisor ◀──{"id":"abc","outcome":{"outcome":"complete"}}── child
//! ```

use crate::activation::TaskParameters;
use crate::registry::TaskRegistry;
use crate::state::{CurrentTaskGuard, CurrentTaskState};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub state: CurrentTaskState,
    pub parameters: TaskParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Complete,
    Failed { error: String, retryable: bool },
}

impl ExecutionOutcome {
    pub fn permanent(error: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildResponse {
    /// Empty when the request line could not be parsed.
    pub id: String,
    pub outcome: ExecutionOutcome,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run one request on the calling thread.
///
/// The current-task slot is set for the duration of the handler and is
/// empty again when this returns, whether the handler succeeded, failed or
/// panicked.
pub fn execute_request(registry: &TaskRegistry, request: &ChildRequest) -> ExecutionOutcome {
    let task = match registry.resolve(&request.state.namespace, &request.state.taskname) {
        Ok(task) => task,
        Err(e) => return ExecutionOutcome::permanent(e.to_string()),
    };

    let _guard = CurrentTaskGuard::enter(request.state.clone());
    match panic::catch_unwind(AssertUnwindSafe(|| task.call(&request.parameters))) {
        Ok(Ok(())) => ExecutionOutcome::Complete,
        Ok(Err(e)) => ExecutionOutcome::Failed {
            retryable: e.is_retryable(),
            error: e.message,
        },
        Err(payload) => ExecutionOutcome::retryable(format!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Serve requests until `reader` reaches EOF.
///
/// Handlers run one at a time on a blocking thread so a slow handler never
/// stalls the runtime driving the pipes.
pub async fn serve_child<R, W>(
    registry: Arc<TaskRegistry>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ChildRequest>(&line) {
            Ok(request) => {
                let id = request.state.id.clone();
                tracing::debug!(task_id = %id, taskname = %request.state.taskname, "Executing task");

                let registry = registry.clone();
                let outcome = tokio::task::spawn_blocking(move || execute_request(&registry, &request))
                    .await
                    .unwrap_or_else(|e| ExecutionOutcome::retryable(format!("executor thread failed: {e}")));
                ChildResponse { id, outcome }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request from supervisor");
                ChildResponse {
                    id: String::new(),
                    outcome: ExecutionOutcome::permanent(format!("malformed request: {e}")),
                }
            }
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;
    }
    Ok(())
}
