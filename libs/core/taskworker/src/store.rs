//! In-process pending-task store and the [`TaskService`] built on it.
//!
//! Backs the `dev` and `broker` modes and the tests. It keeps a FIFO per
//! topic and the last reported status of every activation it has handed out.

use crate::activation::{TaskActivation, TaskStatus};
use crate::client::{TaskProducer, TaskService};
use crate::error::TaskworkerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Record {
    topic: String,
    activation: TaskActivation,
    status: TaskStatus,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    records: HashMap<String, Record>,
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub complete: usize,
    pub retry: usize,
    pub failure: usize,
}

impl StatusCounts {
    /// Activations not yet in a terminal state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing + self.retry
    }
}

#[derive(Debug, Default)]
pub struct PendingTaskStore {
    inner: Mutex<Inner>,
}

impl PendingTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an activation as `Pending`. Re-pushing a known id replaces
    /// its record and queues it again.
    pub fn push(&self, topic: &str, activation: TaskActivation) {
        let mut inner = self.lock();
        let id = activation.id.clone();
        inner.records.insert(
            id.clone(),
            Record {
                topic: topic.to_string(),
                activation,
                status: TaskStatus::Pending,
            },
        );
        inner.queues.entry(topic.to_string()).or_default().push_back(id);
    }

    /// Hand out the oldest pending activation; it moves to `Processing`.
    ///
    /// With no topic, every topic is considered.
    pub fn pop(&self, topic: Option<&str>) -> Option<TaskActivation> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let topics: Vec<String> = match topic {
            Some(topic) => vec![topic.to_string()],
            None => {
                let mut all: Vec<String> = inner.queues.keys().cloned().collect();
                all.sort();
                all
            }
        };

        for topic in topics {
            let Some(queue) = inner.queues.get_mut(&topic) else {
                continue;
            };
            while let Some(id) = queue.pop_front() {
                match inner.records.get_mut(&id) {
                    Some(record) if record.status == TaskStatus::Pending => {
                        record.status = TaskStatus::Processing;
                        return Some(record.activation.clone());
                    }
                    _ => continue,
                }
            }
        }
        None
    }

    /// Apply a reported status.
    ///
    /// Repeating the current status is a no-op. `Retry` puts the next
    /// attempt back on the activation's topic as `Pending`.
    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskworkerError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| TaskworkerError::UnknownActivation(id.to_string()))?;

        if record.status == status {
            return Ok(());
        }
        // the retry was already re-enqueued; a late duplicate report changes nothing
        if status == TaskStatus::Retry
            && record.status == TaskStatus::Pending
            && record.activation.attempt() > 0
        {
            return Ok(());
        }
        if !record.status.can_transition_to(status) {
            return Err(TaskworkerError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }

        if status == TaskStatus::Retry {
            record.activation = record.activation.with_retry();
            record.status = TaskStatus::Pending;
            let topic = record.topic.clone();
            inner.queues.entry(topic).or_default().push_back(id.to_string());
            tracing::debug!(task_id = %id, attempt = record.activation.attempt(), "Re-enqueued activation");
        } else {
            record.status = status;
        }
        Ok(())
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.lock().records.get(id).map(|record| record.status)
    }

    pub fn activation(&self, id: &str) -> Option<TaskActivation> {
        self.lock().records.get(id).map(|record| record.activation.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|record| record.status == TaskStatus::Pending)
            .count()
    }

    pub fn counts(&self) -> StatusCounts {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        for record in inner.records.values() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Complete => counts.complete += 1,
                TaskStatus::Retry => counts.retry += 1,
                TaskStatus::Failure => counts.failure += 1,
            }
        }
        counts
    }
}

/// [`TaskService`] and [`TaskProducer`] over a shared [`PendingTaskStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskService {
    store: Arc<PendingTaskStore>,
}

impl InMemoryTaskService {
    pub fn new(store: Arc<PendingTaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PendingTaskStore> {
        &self.store
    }
}

#[async_trait]
impl TaskService for InMemoryTaskService {
    async fn get_task(
        &self,
        // a single in-process store has no partitions
        _partition: Option<u32>,
        topic: Option<String>,
    ) -> Result<Option<TaskActivation>, TaskworkerError> {
        Ok(self.store.pop(topic.as_deref()))
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskworkerError> {
        self.store.set_status(id, status)
    }
}

#[async_trait]
impl TaskProducer for InMemoryTaskService {
    async fn produce(&self, topic: &str, activation: TaskActivation) -> Result<(), TaskworkerError> {
        self.store.push(topic, activation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::activation;

    #[test]
    fn test_fifo_per_topic() {
        let store = PendingTaskStore::new();
        store.push("a", activation("1", 0, 1));
        store.push("b", activation("2", 0, 1));
        store.push("a", activation("3", 0, 1));

        assert_eq!(store.pop(Some("a")).unwrap().id, "1");
        assert_eq!(store.pop(Some("a")).unwrap().id, "3");
        assert!(store.pop(Some("a")).is_none());
        assert_eq!(store.pop(None).unwrap().id, "2");
        assert_eq!(store.status_of("2"), Some(TaskStatus::Processing));
    }

    #[test]
    fn test_status_reports_are_idempotent() {
        let store = PendingTaskStore::new();
        store.push("a", activation("abc", 0, 1));
        store.pop(None).unwrap();

        store.set_status("abc", TaskStatus::Complete).unwrap();
        store.set_status("abc", TaskStatus::Complete).unwrap();
        assert_eq!(store.status_of("abc"), Some(TaskStatus::Complete));
        assert_eq!(store.counts().complete, 1);
    }

    #[test]
    fn test_retry_requeues_next_attempt() {
        let store = PendingTaskStore::new();
        store.push("a", activation("abc", 0, 3));
        store.pop(Some("a")).unwrap();

        store.set_status("abc", TaskStatus::Retry).unwrap();
        // a duplicated retry report does not enqueue twice
        store.set_status("abc", TaskStatus::Retry).unwrap();
        assert_eq!(store.pending_len(), 1);

        let retried = store.pop(Some("a")).unwrap();
        assert_eq!(retried.id, "abc");
        assert_eq!(retried.attempt(), 1);
        assert!(store.pop(Some("a")).is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let store = PendingTaskStore::new();
        store.push("a", activation("abc", 0, 1));
        assert!(matches!(
            store.set_status("abc", TaskStatus::Complete),
            Err(TaskworkerError::InvalidTransition { .. })
        ));

        store.pop(None).unwrap();
        store.set_status("abc", TaskStatus::Failure).unwrap();
        assert!(matches!(
            store.set_status("abc", TaskStatus::Retry),
            Err(TaskworkerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.set_status("missing", TaskStatus::Complete),
            Err(TaskworkerError::UnknownActivation(_))
        ));
    }

    #[tokio::test]
    async fn test_service_roundtrip() {
        let service = InMemoryTaskService::default();
        service.produce("taskworker", activation("abc", 0, 1)).await.unwrap();

        assert!(service.get_task(None, Some("other".into())).await.unwrap().is_none());
        let task = service.get_task(None, Some("taskworker".into())).await.unwrap().unwrap();
        service.complete_task(&task.id).await.unwrap();

        assert_eq!(service.store().status_of("abc"), Some(TaskStatus::Complete));
        assert_eq!(service.store().counts().outstanding(), 0);
    }
}
