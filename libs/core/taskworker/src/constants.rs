//! Tunables shared by the supervisor, the broker client and the producer.

use std::time::Duration;

/// Capacity of the queue between the fetch loop and the worker slots.
pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 5;

/// Tasks fetched over one broker connection before it is dropped and
/// re-established against the next host.
pub const DEFAULT_REBALANCE_AFTER: u32 = 32;

/// Tasks a child process executes before it is replaced.
pub const DEFAULT_CHILD_TASK_COUNT: u64 = 10_000;

/// Consecutive connection failures after which a broker host is abandoned.
pub const DEFAULT_CONSECUTIVE_UNAVAILABLE_ERRORS: u32 = 3;

/// How long an abandoned broker host stays ineligible.
pub const DEFAULT_TEMPORARY_UNAVAILABLE_HOST_TIMEOUT: Duration = Duration::from_secs(20);

/// Ceiling for the fetch loop's exponential backoff.
pub const MAX_BACKOFF_SECONDS_WHEN_HOST_UNAVAILABLE: u64 = 20;

/// Serialized parameters above this size are zstd-compressed.
pub const MAX_PARAMETER_BYTES_BEFORE_COMPRESSION: usize = 3_000_000;

/// Minimum spacing between two touches of the health check file.
pub const DEFAULT_WORKER_HEALTH_CHECK_SEC_PER_TOUCH: Duration = Duration::from_secs(1);

/// Deadline applied when neither the task nor its namespace sets one.
pub const DEFAULT_PROCESSING_DEADLINE: Duration = Duration::from_secs(10);

/// Retries allowed when neither the task nor its namespace sets a count.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Lifetime of an at-most-once marker. Covers the broker's redelivery
/// window (processing deadline plus claim expiry) with a wide margin.
pub const DEFAULT_AT_MOST_ONCE_TTL: Duration = Duration::from_secs(60 * 60);

/// Sleep between fetches when the broker has no work.
pub const DEFAULT_EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Attempts made to deliver one status report before it is abandoned.
pub const DEFAULT_STATUS_REPORT_ATTEMPTS: u32 = 3;

/// Grace period for a child to exit after its stdin is closed.
pub const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_APPLICATION: &str = "default";
pub const DEFAULT_TOPIC: &str = "taskworker";
pub const CONTROL_TOPIC: &str = "taskworker-control";

/// How often live options (route overrides) are re-read from Redis.
pub const DEFAULT_OPTIONS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Options-store key holding the dynamic namespace → topic overrides.
pub const ROUTE_OVERRIDES_OPTION: &str = "taskworker.route.overrides";

/// Activation header naming the parameter encoding.
pub const COMPRESSION_TYPE_HEADER: &str = "compression-type";
