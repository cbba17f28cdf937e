//! Retry with exponential backoff and jitter.
//!
//! [`BackoffRetrier`] is the generic wrapper: it re-runs an async operation
//! while its failures are classified as retryable, sleeping
//! `min(base_delay * exponential_base^attempt, max_delay)` between attempts.
//! [`StatusAwareRetrier`] specializes it for HTTP: throttled responses back off
//! from a larger base, server failures and dropped connections use the
//! standard base, and any other status is surfaced immediately.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use climate_extract::extract::RetryPolicy;
//!
//! let policy = RetryPolicy::http_status().with_jitter(false);
//! assert_eq!(policy.delay_for(0), Duration::from_secs(2));
//! assert_eq!(policy.delay_for(1), Duration::from_secs(4));
//! assert_eq!(policy.rate_limited_delay_for(1), Duration::from_secs(60));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::constants::RATE_LIMITED_BASE_DELAY;
use super::error::{FailureKind, FetchError};
use super::rate_limiter::parse_retry_after;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default maximum delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Jitter scales a delay by a uniform factor in `[JITTER_FLOOR, 1.0]`.
const JITTER_FLOOR: f64 = 0.5;

/// Errors that can be classified for retry decisions.
pub trait Classify {
    /// Returns the failure class of this error.
    fn kind(&self) -> FailureKind;
}

impl Classify for FetchError {
    fn kind(&self) -> FailureKind {
        FetchError::kind(self)
    }
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * exponential_base^attempt, max_delay) * jitter
/// ```
///
/// `attempt` is 0 for the first retry. With jitter enabled the factor is
/// drawn uniformly from `[0.5, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    max_retries: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    exponential_base: f64,

    /// Whether delays are randomized.
    jitter: bool,

    /// Failure classes that are retried.
    retryable_kinds: HashSet<FailureKind>,

    /// Base delay used instead of `base_delay` after a 429.
    rate_limited_base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings and the standard rate-limit base.
    #[must_use]
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
        jitter: bool,
        retryable_kinds: impl IntoIterator<Item = FailureKind>,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base,
            jitter,
            retryable_kinds: retryable_kinds.into_iter().collect(),
            rate_limited_base_delay: RATE_LIMITED_BASE_DELAY,
        }
    }

    /// Generic network policy: 3 retries from 1s, capped at 60s, on dropped
    /// connections and timeouts.
    #[must_use]
    pub fn network() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_secs(1),
            DEFAULT_MAX_DELAY,
            DEFAULT_EXPONENTIAL_BASE,
            true,
            [FailureKind::Connection, FailureKind::Timeout],
        )
    }

    /// HTTP policy used for upstream API calls: 3 retries from 2s, capped at
    /// 60s, on throttling, server errors, dropped connections and timeouts.
    #[must_use]
    pub fn http_status() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_secs(2),
            DEFAULT_MAX_DELAY,
            DEFAULT_EXPONENTIAL_BASE,
            true,
            [
                FailureKind::Connection,
                FailureKind::Timeout,
                FailureKind::RateLimited,
                FailureKind::ServerError,
            ],
        )
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base and maximum delays.
    #[must_use]
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Sets the base delay used after a 429.
    #[must_use]
    pub fn with_rate_limited_base_delay(mut self, delay: Duration) -> Self {
        self.rate_limited_base_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the base delay of the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the maximum delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether failures of `kind` are retried.
    #[must_use]
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay before retry `attempt` (0-indexed) with the standard base.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.backoff(self.base_delay, attempt))
    }

    /// Delay before retry `attempt` (0-indexed) after a 429.
    #[must_use]
    pub fn rate_limited_delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.backoff(self.rate_limited_base_delay, attempt))
    }

    fn backoff(&self, base: Duration, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = base.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(JITTER_FLOOR..=1.0);
        delay.mul_f64(factor)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        /// The last observed failure.
        last: E,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// A failure was not retryable.
    NotRetryable {
        /// The failure.
        error: E,
        /// Attempts made, including the failing one.
        attempts: u32,
    },

    /// The cancellation token fired before the operation succeeded.
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { last, attempts } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::NotRetryable { error, .. } => write!(f, "{error}"),
            Self::Cancelled { attempts } => write!(f, "cancelled after {attempts} attempts"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Generic retry wrapper with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct BackoffRetrier {
    policy: RetryPolicy,
}

impl BackoffRetrier {
    /// Creates a retrier with `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a class outside the
    /// policy's retryable kinds, exhausts its retries, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] describing how the operation ultimately failed.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(
            operation,
            cancel,
            |error| self.policy.is_retryable(error.kind()),
            |error, attempt| {
                let delay = self.policy.delay_for(attempt);
                debug!(
                    retry_attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying after failure"
                );
                delay
            },
        )
        .await
    }

    /// Core loop shared with [`StatusAwareRetrier`].
    ///
    /// `retryable` decides whether a failure may be retried; `delay` is only
    /// consulted when another attempt will actually be made and receives the
    /// 0-indexed retry number.
    pub(crate) async fn run_with<T, E, F, Fut, R, D>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
        retryable: R,
        delay: D,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        D: Fn(&E, u32) -> Duration,
    {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempts += 1;

            if !retryable(&error) {
                return Err(RetryError::NotRetryable { error, attempts });
            }
            if attempts > self.policy.max_retries {
                return Err(RetryError::Exhausted {
                    last: error,
                    attempts,
                });
            }

            let wait = delay(&error, attempts - 1);
            if !sleep_or_cancel(wait, cancel).await {
                return Err(RetryError::Cancelled { attempts });
            }
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// HTTP-aware retrier.
///
/// | Failure | Retried | Delay base |
/// |---------|---------|------------|
/// | 429 | yes | rate-limited base, at least Retry-After |
/// | 500/502/503/504 | yes | standard base |
/// | connection, timeout | yes | standard base |
/// | other status | no | - |
///
/// Terminal failures are mapped to [`FetchError::RateLimitExceeded`],
/// [`FetchError::Server`], [`FetchError::TransientFetch`] or
/// [`FetchError::RequestRejected`].
#[derive(Debug, Clone)]
pub struct StatusAwareRetrier {
    inner: BackoffRetrier,
}

impl Default for StatusAwareRetrier {
    fn default() -> Self {
        Self::new(RetryPolicy::http_status())
    }
}

impl StatusAwareRetrier {
    /// Creates a retrier with `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: BackoffRetrier::new(policy),
        }
    }

    /// Returns the policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        self.inner.policy()
    }

    /// Delay before retry `attempt` (0-indexed) after `error`.
    #[must_use]
    pub fn delay_after(&self, error: &FetchError, attempt: u32) -> Duration {
        let policy = self.policy();
        match error {
            FetchError::HttpStatus {
                status: 429,
                retry_after,
                ..
            } => {
                let formula = policy.rate_limited_delay_for(attempt);
                match retry_after.as_deref().and_then(parse_retry_after) {
                    Some(hint) => formula.max(hint).min(policy.max_delay()),
                    None => formula,
                }
            }
            _ => policy.delay_for(attempt),
        }
    }

    /// Runs `operation`, retrying throttling, server and connection failures.
    ///
    /// # Errors
    ///
    /// Returns the typed terminal error described on [`StatusAwareRetrier`],
    /// [`FetchError::Cancelled`] if `cancel` fires, or any non-HTTP failure
    /// unchanged.
    pub async fn run<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let result = self
            .inner
            .run_with(
                operation,
                cancel,
                |error: &FetchError| {
                    let kind = error.kind();
                    kind != FailureKind::Rejected && self.policy().is_retryable(kind)
                },
                |error, attempt| {
                    let delay = self.delay_after(error, attempt);
                    if error.kind() == FailureKind::RateLimited {
                        warn!(
                            rate_limited = true,
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            url = error.url().unwrap_or_default(),
                            "upstream throttled request, backing off"
                        );
                    } else {
                        warn!(
                            server_error = true,
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "request failed, backing off"
                        );
                    }
                    delay
                },
            )
            .await;

        result.map_err(into_fetch_error)
    }
}

fn into_fetch_error(error: RetryError<FetchError>) -> FetchError {
    match error {
        RetryError::Cancelled { .. } => FetchError::Cancelled,
        RetryError::NotRetryable { error, .. } => match error {
            FetchError::HttpStatus { url, status, .. } => FetchError::RequestRejected { url, status },
            other => other,
        },
        RetryError::Exhausted { last, attempts } => {
            let url = last.url().unwrap_or_default().to_string();
            match last.kind() {
                FailureKind::RateLimited => FetchError::RateLimitExceeded { url, attempts },
                FailureKind::ServerError => FetchError::Server {
                    url,
                    status: last.status().unwrap_or_default(),
                    attempts,
                },
                _ => FetchError::TransientFetch {
                    url,
                    attempts,
                    source: Box::new(last),
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        policy.with_jitter(false)
    }

    /// Operation that fails with `errors` in order, then succeeds.
    fn scripted(
        calls: &Arc<AtomicU32>,
        errors: Vec<FetchError>,
    ) -> impl FnMut() -> std::future::Ready<Result<&'static str, FetchError>> {
        let calls = Arc::clone(calls);
        let mut errors = errors.into_iter();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(errors.next().map_or(Ok("ok"), Err))
        }
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_presets() {
        let network = RetryPolicy::network();
        assert_eq!(network.max_retries(), 3);
        assert!(network.is_retryable(FailureKind::Connection));
        assert!(network.is_retryable(FailureKind::Timeout));
        assert!(!network.is_retryable(FailureKind::ServerError));

        let http = RetryPolicy::http_status();
        assert!(http.is_retryable(FailureKind::RateLimited));
        assert!(http.is_retryable(FailureKind::ServerError));
        assert!(!http.is_retryable(FailureKind::Rejected));
    }

    #[test]
    fn test_delay_monotonic_and_capped_without_jitter() {
        let policy = no_jitter(RetryPolicy::http_status());
        let delays: Vec<_> = (0..8).map(|a| policy.delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limited_delay_uses_larger_base() {
        let policy = no_jitter(RetryPolicy::http_status());
        assert_eq!(policy.rate_limited_delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.rate_limited_delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.rate_limited_delay_for(5), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::http_status();
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(2), "{delay:?}");
            assert!(delay <= Duration::from_secs(4), "{delay:?}");
        }
    }

    #[test]
    fn test_retry_after_raises_rate_limited_delay_to_cap() {
        let retrier = StatusAwareRetrier::new(no_jitter(RetryPolicy::http_status()));
        let with_hint = FetchError::http_status_with_retry_after("http://x", 429, Some("45".into()));
        assert_eq!(retrier.delay_after(&with_hint, 0), Duration::from_secs(45));

        let huge_hint =
            FetchError::http_status_with_retry_after("http://x", 429, Some("600".into()));
        assert_eq!(retrier.delay_after(&huge_hint, 0), Duration::from_secs(60));

        let small_hint = FetchError::http_status_with_retry_after("http://x", 429, Some("1".into()));
        assert_eq!(retrier.delay_after(&small_hint, 0), Duration::from_secs(30));
    }

    // ==================== BackoffRetrier Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_connection_failures_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = BackoffRetrier::new(no_jitter(RetryPolicy::network()));
        let started = Instant::now();

        let result = retrier
            .run(
                scripted(
                    &calls,
                    vec![FetchError::timeout("http://x"), FetchError::timeout("http://x")],
                ),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = BackoffRetrier::new(no_jitter(RetryPolicy::network()));

        let result = retrier
            .run(
                scripted(&calls, vec![FetchError::http_status("http://x", 503)]),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::NotRetryable { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = BackoffRetrier::new(no_jitter(RetryPolicy::network()));
        let errors = (0..10).map(|_| FetchError::timeout("http://x")).collect();

        let result = retrier
            .run(scripted(&calls, errors), &CancellationToken::new())
            .await;

        match result {
            Err(RetryError::Exhausted { last, attempts }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(last, FetchError::Timeout { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_cancel_interrupts_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = BackoffRetrier::new(no_jitter(RetryPolicy::network()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result = retrier
            .run(scripted(&calls, vec![FetchError::timeout("http://x")]), &cancel)
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ==================== StatusAwareRetrier Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_429_then_200_retries_once_with_rate_limited_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::new(no_jitter(RetryPolicy::http_status()));
        let started = Instant::now();

        let result = retrier
            .run(
                scripted(&calls, vec![FetchError::http_status("http://x", 429)]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_503_then_200_uses_standard_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::new(no_jitter(RetryPolicy::http_status()));
        let started = Instant::now();

        let result = retrier
            .run(
                scripted(&calls, vec![FetchError::http_status("http://x", 503)]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_404_is_rejected_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::default();

        let err = retrier
            .run(
                scripted(&calls, vec![FetchError::http_status("http://x/a", 404)]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::RequestRejected { status: 404, ref url } if url == "http://x/a"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_429_becomes_rate_limit_exceeded() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::default();
        let errors = (0..4).map(|_| FetchError::http_status("http://x", 429)).collect();

        let err = retrier
            .run(scripted(&calls, errors), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimitExceeded { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_5xx_becomes_server_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::new(RetryPolicy::http_status().with_max_retries(1));
        let errors = vec![
            FetchError::http_status("http://x", 500),
            FetchError::http_status("http://x", 502),
        ];

        let err = retrier
            .run(scripted(&calls, errors), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::Server {
                status: 502,
                attempts: 2,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_become_transient_fetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::new(RetryPolicy::http_status().with_max_retries(0));

        let err = retrier
            .run(
                scripted(&calls, vec![FetchError::timeout("http://x")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            FetchError::TransientFetch { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, FetchError::Timeout { .. }));
            }
            other => panic!("expected transient fetch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_errors_pass_through_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::default();

        let err = retrier
            .run(
                scripted(&calls, vec![FetchError::TransportClosed]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::TransportClosed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = StatusAwareRetrier::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = retrier
            .run(scripted(&calls, vec![]), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
