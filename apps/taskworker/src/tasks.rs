//! Handlers of the `examples` namespace.
//!
//! The supervisor and its children both build this registry, so a child can
//! resolve any activation the supervisor hands it.

use std::time::Duration;
use taskworker::state;
use taskworker::{HandlerError, RegistryError, TaskConfig, TaskParameters, TaskRegistry};
use tracing::info;

pub const NAMESPACE: &str = "examples";

fn simple_task(params: &TaskParameters) -> Result<(), HandlerError> {
    info!(args = ?params.args, kwargs = ?params.kwargs, "simple_task");
    if params.kwarg::<bool>("raise_error")?.unwrap_or(false) {
        return Err(HandlerError::from("simple_task was asked to fail"));
    }
    Ok(())
}

fn say_hello(params: &TaskParameters) -> Result<(), HandlerError> {
    let name = params
        .kwarg::<String>("name")?
        .or(params.arg::<String>(0)?)
        .unwrap_or_else(|| "world".to_string());
    info!("Hello, {name}!");
    Ok(())
}

/// Fails until its last attempt.
fn will_retry(_params: &TaskParameters) -> Result<(), HandlerError> {
    let Some(current) = state::current() else {
        return Err(HandlerError::permanent("will_retry called outside a task"));
    };
    if current.retries_remaining {
        info!(task_id = %current.id, attempt = current.attempt, "will_retry failing, a retry remains");
        return Err(HandlerError::from(format!("attempt {} failed", current.attempt)));
    }
    info!(task_id = %current.id, attempt = current.attempt, "will_retry succeeded on its last attempt");
    Ok(())
}

fn fail_permanently(_params: &TaskParameters) -> Result<(), HandlerError> {
    Err(HandlerError::permanent("this task never succeeds"))
}

fn timed_sleep(params: &TaskParameters) -> Result<(), HandlerError> {
    let millis = params.kwarg::<u64>("millis")?.unwrap_or(100);
    std::thread::sleep(Duration::from_millis(millis));
    Ok(())
}

fn panic_task(_params: &TaskParameters) -> Result<(), HandlerError> {
    panic!("panic_task always panics");
}

pub fn build_registry() -> Result<TaskRegistry, RegistryError> {
    let mut registry = TaskRegistry::new().with_application("taskworker");
    registry
        .create_namespace(NAMESPACE)
        .register("simple_task", simple_task, TaskConfig::default())?
        .register("say_hello", say_hello, TaskConfig::default())?
        .register("will_retry", will_retry, TaskConfig::default().with_max_retries(2))?
        .register("fail_permanently", fail_permanently, TaskConfig::default().with_max_retries(3))?
        .register(
            "timed_sleep",
            timed_sleep,
            TaskConfig::default()
                .with_processing_deadline(Duration::from_secs(2))
                .with_max_retries(1),
        )?
        .register("panic_task", panic_task, TaskConfig::default())?;
    Ok(registry)
}

/// Demo activations cycling through the registered tasks.
pub fn demo_tasks(count: usize) -> Vec<(&'static str, TaskParameters)> {
    (0..count)
        .map(|i| match i % 6 {
            0 => ("say_hello", TaskParameters::new().with_kwarg("name", format!("worker {i}"))),
            1 => ("simple_task", TaskParameters::new().with_arg(i as u64)),
            2 => ("will_retry", TaskParameters::new()),
            3 => ("timed_sleep", TaskParameters::new().with_kwarg("millis", 50)),
            4 => ("fail_permanently", TaskParameters::new()),
            _ => ("simple_task", TaskParameters::new().with_kwarg("raise_error", true)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds() {
        let registry = build_registry().unwrap();
        let namespace = registry.namespace(NAMESPACE).unwrap();
        assert_eq!(namespace.tasknames().count(), 6);
        assert_eq!(registry.resolve(NAMESPACE, "will_retry").unwrap().max_attempts(), 3);
    }

    #[test]
    fn test_say_hello_accepts_positional_name() {
        assert!(say_hello(&TaskParameters::new().with_arg("ada")).is_ok());
        assert!(say_hello(&TaskParameters::new()).is_ok());
    }

    #[test]
    fn test_simple_task_can_fail() {
        assert!(simple_task(&TaskParameters::new()).is_ok());
        let err = simple_task(&TaskParameters::new().with_kwarg("raise_error", true)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_will_retry_needs_task_state() {
        assert!(!will_retry(&TaskParameters::new()).unwrap_err().is_retryable());
    }

    #[test]
    fn test_demo_tasks_are_registered() {
        let registry = build_registry().unwrap();
        for (taskname, _) in demo_tasks(12) {
            assert!(registry.resolve(NAMESPACE, taskname).is_ok(), "{taskname}");
        }
    }
}
