//! One logical API call: limiter slot, then status-aware retries over the
//! pooled transport.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::API_NAME;
use super::error::FetchError;
use super::rate_limiter::{Limiter, log_limiter_usage};
use super::retry::StatusAwareRetrier;
use super::transport::{Transport, TransportRequest, TransportResponse};

/// Header carrying the upstream API key.
pub const API_KEY_HEADER: &str = "api_key";

/// Composes limiter, retrier and transport for a single logical call.
///
/// A call takes exactly one limiter slot no matter how many retries the
/// retrier performs underneath it.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    limiter: Arc<dyn Limiter>,
    transport: Arc<dyn Transport>,
    retrier: StatusAwareRetrier,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl RequestExecutor {
    /// Creates an executor without extra headers.
    #[must_use]
    pub fn new(
        limiter: Arc<dyn Limiter>,
        transport: Arc<dyn Transport>,
        retrier: StatusAwareRetrier,
    ) -> Self {
        Self {
            limiter,
            transport,
            retrier,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Sends `key` in the `api_key` header of every request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidInput`] if the key is not a valid header value.
    pub fn with_api_key(mut self, key: &str) -> Result<Self, FetchError> {
        let mut value = HeaderValue::from_str(key)
            .map_err(|_| FetchError::invalid_input("API key contains invalid header characters"))?;
        value.set_sensitive(true);
        self.headers
            .insert(HeaderName::from_static(API_KEY_HEADER), value);
        Ok(self)
    }

    /// Overrides the configured read timeout for every request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the limiter shared by this executor.
    #[must_use]
    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    /// Performs one logical GET of `url`.
    ///
    /// `description` labels the call in logs. The response returned is always
    /// 2xx; anything else has been retried or surfaced as a typed error.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if `cancel` fires while waiting for a slot or between retries
    /// - the typed terminal errors of [`StatusAwareRetrier::run`]
    #[instrument(skip(self, cancel), fields(api = API_NAME))]
    pub async fn execute(
        &self,
        url: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, FetchError> {
        let granted = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            granted = self.limiter.acquire(true) => granted,
        };
        if !granted {
            return Err(FetchError::RateLimitExceeded {
                url: url.to_string(),
                attempts: 0,
            });
        }

        let mut request = TransportRequest::get(url).with_headers(self.headers.clone());
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        let transport = &self.transport;
        let request = &request;
        let result = self
            .retrier
            .run(
                move || async move {
                    let response = transport.execute(request).await?;
                    if response.is_success() {
                        Ok(response)
                    } else {
                        Err(FetchError::http_status_with_retry_after(
                            &request.url,
                            response.status,
                            response.retry_after.clone(),
                        ))
                    }
                },
                cancel,
            )
            .await;

        match &result {
            Ok(response) => info!(
                api = API_NAME,
                url,
                status = response.status,
                description,
                "API call"
            ),
            Err(error) => warn!(
                api = API_NAME,
                url,
                status = error.status(),
                description,
                error = %error,
                "API call failed"
            ),
        }
        log_limiter_usage(&self.limiter.stats());

        result
    }

    /// Performs the upstream two-step protocol: the call to `url` returns an
    /// [`Envelope`] whose `datos` URL is then fetched and decoded as `T`.
    ///
    /// Returns `Ok(None)` when the envelope reports 404 (nothing available).
    ///
    /// # Errors
    ///
    /// - [`FetchError::Upstream`] for any other envelope status
    /// - [`FetchError::MissingDataUrl`] when a 200 envelope has no data URL
    /// - [`FetchError::Decode`] when either body is not the expected JSON
    /// - any error from [`execute`](Self::execute)
    pub async fn fetch_payload<T: DeserializeOwned>(
        &self,
        url: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, FetchError> {
        let envelope: Envelope = self
            .execute(url, &format!("{description} (metadata)"), cancel)
            .await?
            .json(url)?;

        match envelope.estado {
            200 => {}
            404 => {
                debug!(url, description = %envelope.descripcion, "upstream has no data");
                return Ok(None);
            }
            status => {
                return Err(FetchError::Upstream {
                    status,
                    description: envelope.descripcion,
                });
            }
        }

        let data_url = envelope
            .datos
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| FetchError::MissingDataUrl {
                url: url.to_string(),
            })?;

        let payload = self
            .execute(&data_url, &format!("{description} (data)"), cancel)
            .await?
            .json(&data_url)?;
        Ok(Some(payload))
    }
}

/// Metadata envelope answered by the first call of every upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    /// Upstream status code, independent of the HTTP status.
    pub estado: u16,
    /// Human-readable status description.
    #[serde(default)]
    pub descripcion: String,
    /// URL of the actual payload.
    #[serde(default)]
    pub datos: Option<String>,
}

/// In-memory transport for unit tests: per-URL queues of scripted outcomes,
/// 404 once a queue is empty.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    routes: std::sync::Mutex<
        std::collections::HashMap<String, std::collections::VecDeque<Result<TransportResponse, FetchError>>>,
    >,
    seen: std::sync::Mutex<Vec<TransportRequest>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockTransport {
    pub(crate) fn push(&self, url: &str, outcome: Result<TransportResponse, FetchError>) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub(crate) fn push_json(&self, url: &str, status: u16, body: &serde_json::Value) {
        self.push(url, Ok(TransportResponse::new(status, body.to_string())));
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self, url: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
        self.seen.lock().unwrap().push(request.clone());
        self.routes
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(std::collections::VecDeque::pop_front)
            .unwrap_or_else(|| Ok(TransportResponse::new(404, "")))
    }
}
