//! Liveness reporting.
//!
//! - a health check file touched while broker RPCs succeed (fetches and
//!   status reports), for process managers that watch mtimes
//! - Axum handlers for liveness (`/health`, `/healthz`), readiness
//!   (`/ready`, `/readyz`) and Prometheus metrics (`/metrics`)

use crate::constants::DEFAULT_WORKER_HEALTH_CHECK_SEC_PER_TOUCH;
use crate::metrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// File whose modification time signals a live worker.
///
/// Shared behind an `Arc` by the fetch loop and every slot.
#[derive(Debug)]
pub struct HealthCheckFile {
    path: PathBuf,
    min_interval: Duration,
    last_touch: Mutex<Option<Instant>>,
}

impl HealthCheckFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_interval: DEFAULT_WORKER_HEALTH_CHECK_SEC_PER_TOUCH,
            last_touch: Mutex::new(None),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file unless it was touched within the interval.
    /// Returns whether a write happened.
    pub async fn touch_if_due(&self) -> std::io::Result<bool> {
        let now = Instant::now();
        let previous = {
            let mut last_touch = self.last_touch.lock().unwrap_or_else(|e| e.into_inner());
            if last_touch.is_some_and(|last| now.duration_since(last) < self.min_interval) {
                return Ok(false);
            }
            last_touch.replace(now)
        };

        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(e) = tokio::fs::write(&self.path, stamp).await {
            // let the next caller try again
            *self.last_touch.lock().unwrap_or_else(|e| e.into_inner()) = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// [`Self::touch_if_due`], logging instead of returning failures.
    pub async fn touch(&self) {
        if let Err(e) = self.touch_if_due().await {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not touch health check file");
        }
    }
}

/// Shared state for health endpoints.
#[derive(Clone, Debug)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    /// Set while the fetch loop is running.
    pub ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Always OK while the process answers.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// OK once the fetch loop has started, 503 before that and after shutdown begins.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
