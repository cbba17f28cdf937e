//! Pooled HTTP transport for upstream API calls.
//!
//! [`PooledTransport`] wraps a single `reqwest::Client` configured for
//! connection reuse, fixed connect/read timeouts and compressed JSON
//! responses. On top of reqwest's own idle pool it bounds how many requests
//! may be checked out against one host at a time, and retries a small
//! allowlist of statuses with a short exponential backoff before handing the
//! response to the status-aware retrier above it. A response carrying a
//! usable `Retry-After` is handed up at once, since only the retrier above
//! waits that long.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONNECTION, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BACKOFF_FACTOR, DEFAULT_POOL_CONNECTIONS,
    DEFAULT_POOL_MAX_SIZE, DEFAULT_RETRYABLE_STATUSES, DEFAULT_TRANSPORT_RETRIES,
    READ_TIMEOUT_SECS,
};
use super::error::FetchError;
use super::rate_limiter::parse_retry_after;
use crate::user_agent;

/// Executes one HTTP exchange.
///
/// Non-success statuses are returned as responses, not errors; only failures
/// that produced no response at all (connect, timeout, closed transport) are
/// errors.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends `request` and returns the final response.
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError>;
}

/// Connection pool and transport-level retry settings.
///
/// Created once per client and shared read-only by every request.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of distinct per-host pools kept alive.
    pub pool_connections: usize,
    /// Maximum connections checked out against one host.
    pub pool_max_size: usize,
    /// Transport-level retries for `retryable_statuses`.
    pub max_retries: u32,
    /// Backoff factor in seconds; retry `n` sleeps `factor * 2^(n-1)`.
    pub backoff_factor: f64,
    /// Statuses retried at the transport level.
    pub retryable_statuses: BTreeSet<u16>,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout applied to every request unless overridden.
    pub read_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_connections: DEFAULT_POOL_CONNECTIONS,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            max_retries: DEFAULT_TRANSPORT_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Sleep before transport-level retry number `retry` (1-indexed).
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Extra headers merged over the client defaults.
    pub headers: HeaderMap,
    /// Overall timeout overriding the configured read timeout.
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    /// Creates a GET request with no extra headers.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Replaces the extra headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response of a single exchange, body fully read.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// Retry-After header value, if any.
    pub retry_after: Option<String>,
}

impl TransportResponse {
    /// Creates a response without a Retry-After header.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text; bodies that are not UTF-8 are read as ISO-8859-1.
    #[must_use]
    pub fn text(&self) -> String {
        decode_body(&self.body)
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Decode`] when the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        serde_json::from_str(&self.text()).map_err(|e| FetchError::decode(url, e))
    }
}

/// Decodes a response body, falling back to ISO-8859-1 for non-UTF-8 bytes.
#[must_use]
pub fn decode_body(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        // Latin-1 maps every byte to the code point of the same value
        Err(_) => body.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Snapshot returned by [`PooledTransport::pool_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Configured number of per-host pools.
    pub pools: usize,
    /// Configured connections per host.
    pub max_size: usize,
    /// Host pools currently tracked.
    pub hosts: usize,
    /// Requests currently checked out across all hosts.
    pub active_connections: usize,
    /// Requests sent, including transport-level retries.
    pub requests_sent: u64,
    /// Transport-level retries performed.
    pub transport_retries: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: f64,
    /// Read timeout in seconds.
    pub read_timeout_secs: f64,
    /// Transport-level retry settings.
    pub retry_config: TransportRetryStats,
    /// Whether [`PooledTransport::close`] has been called.
    pub closed: bool,
}

/// Transport-level retry settings as reported in [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRetryStats {
    /// Maximum transport-level retries.
    pub max_retries: u32,
    /// Backoff factor in seconds.
    pub backoff_factor: f64,
    /// Statuses retried at this level.
    pub retryable_statuses: Vec<u16>,
}

/// Checkout slots for a single host.
#[derive(Debug)]
struct HostPool {
    slots: Semaphore,
    size: usize,
}

impl HostPool {
    fn new(size: usize) -> Self {
        Self {
            slots: Semaphore::new(size),
            size,
        }
    }

    fn in_use(&self) -> usize {
        self.size.saturating_sub(self.slots.available_permits())
    }
}

/// HTTP transport with per-host connection pooling and status retry.
///
/// This transport is designed to be created once and shared (via `Arc`) by
/// every request a client makes, so connections are reused across calls.
#[derive(Debug)]
pub struct PooledTransport {
    config: PoolConfig,
    client: RwLock<Option<Client>>,
    /// Per-host checkout slots. Arc lets callers release the `DashMap` shard
    /// lock before awaiting a permit.
    pools: DashMap<String, Arc<HostPool>>,
    closed: AtomicBool,
    requests_sent: AtomicU64,
    transport_retries: AtomicU64,
}

impl PooledTransport {
    /// Creates a transport from `config` with the default identifying headers.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] when reqwest rejects the configuration.
    #[instrument(level = "debug", skip_all, fields(pools = config.pool_connections, max_size = config.pool_max_size))]
    pub fn new(config: PoolConfig) -> Result<Self, FetchError> {
        let client = build_client(&config).map_err(FetchError::ClientBuild)?;
        debug!("created pooled transport");
        Ok(Self {
            config,
            client: RwLock::new(Some(client)),
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
            transport_retries: AtomicU64::new(0),
        })
    }

    /// Returns the configuration this transport was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases pooled connections. Later requests fail with
    /// [`FetchError::TransportClosed`]; requests waiting for a host slot are
    /// woken with the same error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for pool in &self.pools {
            pool.slots.close();
        }
        self.pools.clear();
        debug!("pooled transport closed");
    }

    /// Returns a snapshot of pool occupancy and settings.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pool_stats(&self) -> PoolStats {
        let active_connections = self.pools.iter().map(|pool| pool.in_use()).sum();
        PoolStats {
            pools: self.config.pool_connections,
            max_size: self.config.pool_max_size,
            hosts: self.pools.len(),
            active_connections,
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            transport_retries: self.transport_retries.load(Ordering::SeqCst),
            connect_timeout_secs: self.config.connect_timeout.as_secs_f64(),
            read_timeout_secs: self.config.read_timeout.as_secs_f64(),
            retry_config: TransportRetryStats {
                max_retries: self.config.max_retries,
                backoff_factor: self.config.backoff_factor,
                retryable_statuses: self.config.retryable_statuses.iter().copied().collect(),
            },
            closed: self.is_closed(),
        }
    }

    fn current_client(&self) -> Result<Client, FetchError> {
        if self.is_closed() {
            return Err(FetchError::TransportClosed);
        }
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FetchError::TransportClosed)
    }

    /// Gets or creates the pool for `host`, evicting an idle pool when the
    /// configured number of pools is reached.
    ///
    /// A pool is idle only while the map holds its sole reference; a caller
    /// between checkout and permit acquisition keeps it alive, so one host
    /// never has two pools at once.
    fn host_pool(&self, host: &str) -> Arc<HostPool> {
        if let Some(pool) = self.pools.get(host) {
            return Arc::clone(&pool);
        }

        if self.pools.len() >= self.config.pool_connections.max(1) {
            let idle = self
                .pools
                .iter()
                .find(|entry| Arc::strong_count(entry.value()) == 1)
                .map(|entry| entry.key().clone());
            if let Some(idle) = idle {
                if self
                    .pools
                    .remove_if(&idle, |_, pool| Arc::strong_count(pool) == 1)
                    .is_some()
                {
                    debug!(host = %idle, "evicting idle host pool");
                }
            }
        }

        let entry = self
            .pools
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostPool::new(self.config.pool_max_size.max(1))));
        Arc::clone(entry.value())
    }

    async fn send_once(
        &self,
        client: &Client,
        request: &TransportRequest,
    ) -> Result<TransportResponse, FetchError> {
        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        self.requests_sent.fetch_add(1, Ordering::SeqCst);
        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&request.url, e))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&request.url, e))?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
            retry_after,
        })
    }
}

#[async_trait]
impl Transport for PooledTransport {
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
        let client = self.current_client()?;
        let host = extract_host(&request.url)
            .ok_or_else(|| FetchError::invalid_url(request.url.clone()))?;

        let pool = self.host_pool(&host);

        let mut retry = 0;
        loop {
            // The checkout slot covers one exchange and is released before any backoff sleep.
            let response = {
                let _slot = pool
                    .slots
                    .acquire()
                    .await
                    .map_err(|_| FetchError::TransportClosed)?;
                self.send_once(&client, request).await?
            };

            if retry >= self.config.max_retries
                || !self.config.retryable_statuses.contains(&response.status)
            {
                return Ok(response);
            }

            if let Some(hint) = response.retry_after.as_deref().and_then(parse_retry_after) {
                debug!(
                    status = response.status,
                    retry_after_secs = hint.as_secs(),
                    "upstream asked to wait, deferring to caller"
                );
                return Ok(response);
            }

            retry += 1;
            self.transport_retries.fetch_add(1, Ordering::SeqCst);
            let delay = self.config.backoff_for(retry);
            warn!(
                status = response.status,
                retry,
                delay_ms = delay.as_millis(),
                "transport retrying allowlisted status"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

fn build_client(config: &PoolConfig) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_size)
        .gzip(true)
        .user_agent(user_agent::default_user_agent())
        .default_headers(headers)
        .build()
}

/// Extracts the lowercase host (with port, when present) used as pool key.
#[must_use]
pub fn extract_host(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_connections, 10);
        assert_eq!(config.pool_max_size, 20);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(
            config.retryable_statuses.iter().copied().collect::<Vec<_>>(),
            vec![429, 500, 502, 503, 504]
        );
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        let config = PoolConfig::default();
        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(300));
        assert_eq!(config.backoff_for(2), Duration::from_millis(600));
        assert_eq!(config.backoff_for(3), Duration::from_millis(1200));
    }

    #[test]
    fn test_decode_body_utf8_and_latin1() {
        assert_eq!(decode_body("Almería".as_bytes()), "Almería");
        // "Almería" in ISO-8859-1
        assert_eq!(decode_body(b"Almer\xeda"), "Almería");
    }

    #[test]
    fn test_response_json_decodes_latin1() {
        let response = TransportResponse::new(200, b"{\"nombre\":\"C\xc1DIZ\"}".to_vec());
        let value: serde_json::Value = response.json("http://x").unwrap();
        assert_eq!(value["nombre"], "CÁDIZ");
    }

    #[test]
    fn test_response_json_error_is_decode() {
        let response = TransportResponse::new(200, b"not json".to_vec());
        let err = response.json::<serde_json::Value>("http://x").unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://OpenData.aemet.es/opendata/api"),
            Some("opendata.aemet.es".to_string())
        );
        assert_eq!(
            extract_host("http://127.0.0.1:8080/x"),
            Some("127.0.0.1:8080".to_string())
        );
        assert_eq!(extract_host("not a url"), None);
    }

    #[test]
    fn test_host_pool_reuses_and_evicts_only_unreferenced_pools() {
        let transport = PooledTransport::new(PoolConfig {
            pool_connections: 1,
            ..PoolConfig::default()
        })
        .unwrap();

        let held = transport.host_pool("a.example");
        assert!(Arc::ptr_eq(&held, &transport.host_pool("a.example")));

        // "a" is still referenced, so it must survive a new host arriving.
        let other = transport.host_pool("b.example");
        assert_eq!(transport.pool_stats().hosts, 2);
        assert!(Arc::ptr_eq(&held, &transport.host_pool("a.example")));

        drop(held);
        drop(other);
        transport.host_pool("c.example");
        assert_eq!(transport.pool_stats().hosts, 2);
        assert!(transport.pools.contains_key("c.example"));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let transport = PooledTransport::new(PoolConfig::default()).unwrap();
        transport.close();
        transport.close();

        let err = transport
            .execute(&TransportRequest::get("http://127.0.0.1:9/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TransportClosed));
        assert!(transport.pool_stats().closed);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_sending() {
        let transport = PooledTransport::new(PoolConfig::default()).unwrap();
        let err = transport
            .execute(&TransportRequest::get("no scheme here"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert_eq!(transport.pool_stats().requests_sent, 0);
    }
}
