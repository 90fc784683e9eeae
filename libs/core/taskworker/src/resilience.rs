//! Broker host availability tracking.
//!
//! Every broker host gets a circuit breaker. A host whose breaker opens is
//! skipped when picking the next connection target until its timeout has
//! elapsed, after which one probe is let through.
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ timeout elapsed
//!      │                                   v
//!      │      success            ┌─────────────┐
//!      └──────────────────────── │ HALF-OPEN   │
//!                                └─────────────┘
//!                                      │
//!                       failure        │
//!                       ───────────────┘
//! ```

use crate::constants::{
    DEFAULT_CONSECUTIVE_UNAVAILABLE_ERRORS, DEFAULT_TEMPORARY_UNAVAILABLE_HOST_TIMEOUT,
};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CONSECUTIVE_UNAVAILABLE_ERRORS,
            timeout: DEFAULT_TEMPORARY_UNAVAILABLE_HOST_TIMEOUT,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go through now. An open circuit whose timeout has
    /// elapsed moves to half-open and admits the call.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.timeout);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    tracing::debug!("Circuit breaker half-open, probing host");
                }
                elapsed
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed, host recovered");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}

/// Round-robin choice among broker hosts, skipping open circuits.
#[derive(Debug)]
pub struct HostSelector {
    hosts: Vec<(String, CircuitBreaker)>,
}

impl HostSelector {
    pub fn new(hosts: Vec<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| (host, CircuitBreaker::new(config)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn host(&self, index: usize) -> Option<&str> {
        self.hosts.get(index).map(|(host, _)| host.as_str())
    }

    /// First eligible host after `after`, wrapping around (and including
    /// `after` itself last). When every host is unavailable the next host in
    /// order is returned anyway; the caller backs off between attempts.
    pub fn next_available(&self, after: Option<usize>) -> Option<usize> {
        let count = self.hosts.len();
        if count == 0 {
            return None;
        }
        let start = after.map_or(0, |index| index + 1);

        (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&index| self.hosts[index].1.can_execute())
            .or(Some(start % count))
    }

    pub fn record_success(&self, index: usize) {
        if let Some((_, breaker)) = self.hosts.get(index) {
            breaker.record_success();
        }
    }

    /// Returns `true` when the host just became unavailable.
    pub fn record_failure(&self, index: usize) -> bool {
        match self.hosts.get(index) {
            Some((host, breaker)) => {
                let opened = breaker.record_failure();
                if opened {
                    tracing::warn!(host = %host, "Broker host marked temporarily unavailable");
                }
                opened
            }
            None => false,
        }
    }

    pub fn state(&self, index: usize) -> Option<CircuitState> {
        self.hosts.get(index).map(|(_, breaker)| breaker.state())
    }
}
