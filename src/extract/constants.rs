//! Constants for the extraction module (timeouts, pooling, rate limiting, batching).

use std::time::Duration;

/// Default upstream API root.
pub const DEFAULT_BASE_URL: &str = "https://opendata.aemet.es/opendata/api";

/// Label used in per-call log events.
pub const API_NAME: &str = "AEMET";

/// Default HTTP connect timeout (5 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default HTTP read timeout (30 seconds).
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Default number of distinct per-host pools kept alive.
pub const DEFAULT_POOL_CONNECTIONS: usize = 10;

/// Default number of connections per host pool.
pub const DEFAULT_POOL_MAX_SIZE: usize = 20;

/// Default transport-level retries for allowlisted statuses.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;

/// Default transport-level backoff factor in seconds.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 0.3;

/// Statuses retried by the transport before the status-aware retrier sees them.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Default sliding-window budget: 90 requests per minute (upstream allows ~100).
pub const DEFAULT_MAX_REQUESTS: usize = 90;

/// Default sliding-window length.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Default maximum span of a single data request, in months.
pub const DEFAULT_MAX_SPAN_MONTHS: u32 = 6;

/// Base delay for retries after an upstream 429.
pub const RATE_LIMITED_BASE_DELAY: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Placeholder the upstream uses for "inappreciable" precipitation.
pub const PLACEHOLDER_TOKEN: &str = "Ip";
