//! Resilient extraction of daily climate records from a rate-limited API.
//!
//! A logical call flows through three layers, each behind its own type:
//!
//! - [`SlidingWindowLimiter`] bounds the request rate for every task sharing it
//! - [`StatusAwareRetrier`] backs off on retryable failures
//! - [`PooledTransport`] reuses connections and retries a status allowlist
//!
//! [`RequestExecutor`] composes them; [`RangeBatcher`] splits long date ranges
//! into upstream-sized windows; [`ClimateClient`] owns the shared state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use climate_extract::extract::{ClientConfig, ClimateClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(ClimateClient::new(ClientConfig::from_env())?);
//! let cancel = CancellationToken::new();
//!
//! let mut tasks = Vec::new();
//! for station in ["5790Y", "3195", "0076"] {
//!     let client = Arc::clone(&client);
//!     let cancel = cancel.clone();
//!     tasks.push(tokio::spawn(async move {
//!         client
//!             .fetch_daily_records(station, "2020-01-01", "2020-12-31", &cancel)
//!             .await
//!     }));
//! }
//! for task in tasks {
//!     println!("{} records", task.await??.len());
//! }
//! println!("{:?}", client.rate_limiter_stats());
//! # Ok(())
//! # }
//! ```

mod batch;
mod client;
mod constants;
mod error;
mod executor;
mod rate_limiter;
mod record;
mod retry;
mod transport;

pub use batch::{BatchPlan, DateSpan, RangeBatcher, months_between};
pub use client::{API_KEY_ENV, ClientConfig, ClimateClient};
pub use constants::{DEFAULT_BASE_URL, DEFAULT_MAX_SPAN_MONTHS};
pub use error::{FailureKind, FetchError, classify_http_status};
pub use executor::{API_KEY_HEADER, Envelope, RequestExecutor};
pub use rate_limiter::{
    Limiter, RateLimitConfig, RateLimiterStats, SlidingWindowLimiter, parse_retry_after,
};
pub use record::{DailyRecord, RecordError, parse_numeric, parse_record, parse_records};
pub use retry::{
    BackoffRetrier, Classify, DEFAULT_MAX_RETRIES, RetryError, RetryPolicy, StatusAwareRetrier,
};
pub use transport::{
    PoolConfig, PoolStats, PooledTransport, Transport, TransportRequest, TransportResponse,
    TransportRetryStats, decode_body,
};
