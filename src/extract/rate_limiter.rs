//! Sliding-window rate limiting for upstream API requests.
//!
//! This module provides [`SlidingWindowLimiter`], which bounds outbound traffic
//! to at most `max_requests` grants inside any trailing window of fixed length.
//! Unlike a fixed-bucket limiter there is no window reset: a slot frees up
//! exactly when the grant that occupied it ages out.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use climate_extract::extract::SlidingWindowLimiter;
//!
//! # async fn example() {
//! let limiter = SlidingWindowLimiter::new(90, Duration::from_secs(60));
//!
//! // Blocks until a slot is free
//! assert!(limiter.acquire(true).await);
//!
//! // Never blocks; returns false when the window is full
//! let _granted = limiter.acquire(false).await;
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::constants::{DEFAULT_MAX_REQUESTS, DEFAULT_RATE_WINDOW, MAX_RETRY_AFTER};

/// Usage percentage above which limiter status is logged as a warning.
const HIGH_USAGE_PERCENT: f64 = 80.0;

/// Usage percentage above which limiter status is logged at info level.
const MODERATE_USAGE_PERCENT: f64 = 60.0;

/// Source of request slots for the executor.
#[async_trait]
pub trait Limiter: Send + Sync + std::fmt::Debug {
    /// Tries to take a slot. When `wait` is true, suspends until one is free.
    async fn acquire(&self, wait: bool) -> bool;

    /// Point-in-time snapshot of limiter occupancy.
    fn stats(&self) -> RateLimiterStats;
}

/// Sliding-window budget configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum grants inside any trailing window.
    pub max_requests: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_RATE_WINDOW,
        }
    }
}

/// Read-only snapshot returned by [`SlidingWindowLimiter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Grants still inside the window.
    pub current: usize,
    /// Configured capacity.
    pub max: usize,
    /// Window length in seconds.
    pub window_secs: f64,
    /// Slots that can be granted right now.
    pub available: usize,
}

impl RateLimiterStats {
    /// Share of capacity in use, 0-100.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percent(&self) -> f64 {
        if self.max == 0 {
            return 100.0;
        }
        self.current as f64 / self.max as f64 * 100.0
    }
}

/// Thread-safe sliding-window rate limiter.
///
/// Granted timestamps are kept oldest-first in a `VecDeque` behind a mutex.
/// Every call evicts expired entries before looking at capacity, and the
/// evict + check + append sequence runs under a single lock acquisition.
/// The lock is never held across a sleep: a waiter computes how long until the
/// oldest grant expires, releases the lock, sleeps, and re-checks, so waiters
/// racing for the same freed slot cannot overshoot capacity.
///
/// Designed to be wrapped in `Arc` and shared by concurrent extraction tasks.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    granted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter allowing `max_requests` grants per `window`.
    ///
    /// A `max_requests` of zero is raised to one.
    #[must_use]
    #[instrument(skip_all, fields(max_requests, window_secs = window.as_secs_f64()))]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        tracing::Span::current().record("max_requests", max_requests);
        debug!("creating sliding window limiter");
        Self {
            max_requests,
            window,
            granted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Creates a limiter from a [`RateLimitConfig`].
    #[must_use]
    pub fn from_config(config: RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Returns the configured window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Acquires a request slot.
    ///
    /// Returns `true` once a slot has been recorded. With `wait == false`
    /// returns `false` immediately when the window is full; with
    /// `wait == true` suspends until the oldest grant ages out.
    pub async fn acquire(&self, wait: bool) -> bool {
        loop {
            let wait_time = {
                let mut granted = self.lock_granted();
                let now = Instant::now();
                self.evict_expired(&mut granted, now);

                if granted.len() < self.max_requests {
                    granted.push_back(now);
                    return true;
                }

                if !wait {
                    debug!(current = granted.len(), "rate limit window full, not waiting");
                    return false;
                }

                granted
                    .front()
                    .map_or(Duration::ZERO, |oldest| {
                        (*oldest + self.window).saturating_duration_since(now)
                    })
            };

            debug!(
                wait_ms = wait_time.as_millis(),
                "rate limit reached, waiting for a slot"
            );
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Returns a snapshot of the limiter, evicting expired grants first.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut granted = self.lock_granted();
        self.evict_expired(&mut granted, Instant::now());
        let current = granted.len();
        RateLimiterStats {
            current,
            max: self.max_requests,
            window_secs: self.window.as_secs_f64(),
            available: self.max_requests.saturating_sub(current),
        }
    }

    /// Forgets every recorded grant.
    pub fn reset(&self) {
        self.lock_granted().clear();
        debug!("rate limiter reset");
    }

    fn evict_expired(&self, granted: &mut VecDeque<Instant>, now: Instant) {
        while granted
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.window)
        {
            granted.pop_front();
        }
    }

    fn lock_granted(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn acquire(&self, wait: bool) -> bool {
        SlidingWindowLimiter::acquire(self, wait).await
    }

    fn stats(&self) -> RateLimiterStats {
        SlidingWindowLimiter::stats(self)
    }
}

/// Logs limiter occupancy at a level matching how close it is to capacity.
pub fn log_limiter_usage(stats: &RateLimiterStats) {
    let usage = stats.usage_percent();
    if usage > HIGH_USAGE_PERCENT {
        warn!(
            current = stats.current,
            max = stats.max,
            available = stats.available,
            usage_percent = usage,
            "high rate limiter usage"
        );
    } else if usage > MODERATE_USAGE_PERCENT {
        info!(
            current = stats.current,
            max = stats.max,
            usage_percent = usage,
            "moderate rate limiter usage"
        );
    } else {
        debug!(current = stats.current, max = stats.max, "rate limiter usage");
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Accepts integer seconds or an RFC 7231 HTTP-date. Dates in the past yield
/// zero; values above one hour are capped. Returns `None` when unparseable.
///
/// ```
/// use std::time::Duration;
/// use climate_extract::extract::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    let delay = if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        Duration::from_secs(seconds)
    } else {
        let when = httpdate::parse_http_date(header_value).ok()?;
        when.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO)
    };

    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(delay)
}
