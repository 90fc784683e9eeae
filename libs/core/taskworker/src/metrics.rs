//! Prometheus metrics for the taskworker
//!
//! Provides observability into executions, dedup skips, broker errors and
//! the child pool.

use crate::activation::TaskStatus;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Record the reported outcome of one execution
pub fn record_execution(namespace: &str, taskname: &str, status: TaskStatus, duration: Duration) {
    counter!(
        "taskworker_executions_total",
        "namespace" => namespace.to_string(),
        "taskname" => taskname.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "taskworker_execution_duration_seconds",
        "namespace" => namespace.to_string(),
        "taskname" => taskname.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a delivery skipped by the at-most-once check
pub fn record_dedup_skip(namespace: &str) {
    counter!(
        "taskworker_at_most_once_skips_total",
        "namespace" => namespace.to_string()
    )
    .increment(1);
}

/// Record an at-most-once store failure and whether the activation ran anyway
pub fn record_at_most_once_error(namespace: &str, fail_open: bool) {
    counter!(
        "taskworker_at_most_once_errors_total",
        "namespace" => namespace.to_string(),
        "action" => if fail_open { "executed" } else { "skipped" }
    )
    .increment(1);
}

pub fn record_rpc_error(rpc: &'static str, connection: bool) {
    counter!(
        "taskworker_rpc_errors_total",
        "rpc" => rpc,
        "kind" => if connection { "connection" } else { "status" }
    )
    .increment(1);
}

/// Record a child process start; `reason` is `initial`, `recycle`, `timeout` or `crash`
pub fn record_child_spawn(reason: &'static str) {
    counter!("taskworker_child_spawns_total", "reason" => reason).increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("taskworker_queue_depth").set(depth as f64);
}
