//! Fixtures shared by unit tests.

use crate::activation::{RetryState, TaskActivation};
use std::collections::HashMap;
use std::time::Duration;

pub(crate) fn activation(id: &str, attempts: u32, max_attempts: u32) -> TaskActivation {
    TaskActivation {
        id: id.to_string(),
        namespace: "examples".to_string(),
        taskname: "simple_task".to_string(),
        parameters: br#"{"args":[],"kwargs":{}}"#.to_vec(),
        headers: HashMap::new(),
        retry_state: RetryState {
            attempts,
            max_attempts,
        },
        processing_deadline_duration: Duration::ZERO,
        received_at: None,
    }
}
