//! Error types for the extraction module.
//!
//! Raw transport failures (`Network`, `Timeout`, `HttpStatus`) are what a single
//! attempt produces. The retriers turn them into the terminal variants
//! (`TransientFetch`, `RateLimitExceeded`, `Server`, `RequestRejected`) once
//! retrying is over, annotated with the number of attempts made.

use thiserror::Error;

/// Coarse classification of a failure, consumed by the retriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection refused, reset, DNS failure.
    Connection,
    /// Connect or read timeout.
    Timeout,
    /// Upstream throttling (HTTP 429).
    RateLimited,
    /// Upstream 500, 502, 503 or 504.
    ServerError,
    /// Any other HTTP status outside 2xx.
    Rejected,
    /// Local failures that retrying cannot fix.
    Permanent,
}

/// Errors produced while extracting climate records.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response from a single attempt.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// Connection or timeout failures persisted through every retry.
    #[error("transient failure requesting {url} after {attempts} attempts: {source}")]
    TransientFetch {
        /// The URL that failed.
        url: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// The last observed failure.
        #[source]
        source: Box<FetchError>,
    },

    /// Upstream kept answering 429 through every retry.
    #[error("rate limit exceeded requesting {url} after {attempts} attempts")]
    RateLimitExceeded {
        /// The URL that was throttled.
        url: String,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// Upstream kept failing with 5xx through every retry.
    #[error("server error HTTP {status} requesting {url} after {attempts} attempts")]
    Server {
        /// The URL that failed.
        url: String,
        /// The last observed status code.
        status: u16,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// Upstream rejected the request with a client error other than 429.
    #[error("request rejected with HTTP {status}: {url}")]
    RequestRejected {
        /// The URL that was rejected.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Caller-supplied arguments are invalid (bad dates, inverted range, ...).
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the violated precondition.
        message: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Response body could not be decoded as the expected JSON.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        /// The URL whose body failed to decode.
        url: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Metadata call answered with an `estado` other than 200 or 404.
    #[error("upstream returned status {status}: {description}")]
    Upstream {
        /// The `estado` field of the metadata response.
        status: u16,
        /// The `descripcion` field of the metadata response.
        description: String,
    },

    /// Metadata call succeeded but did not include a data URL.
    #[error("metadata response from {url} has no data URL")]
    MissingDataUrl {
        /// The metadata URL.
        url: String,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport was closed before the request was issued.
    #[error("transport closed")]
    TransportClosed,

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            url: url.into(),
            source,
        }
    }

    /// Classifies this error for retry decisions.
    ///
    /// | Error | Kind |
    /// |-------|------|
    /// | `Network` | Connection |
    /// | `Timeout` | Timeout |
    /// | `HttpStatus` 429 | RateLimited |
    /// | `HttpStatus` 500/502/503/504 | ServerError |
    /// | `HttpStatus` other | Rejected |
    /// | everything else | Permanent |
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } => FailureKind::Connection,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            _ => FailureKind::Permanent,
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. }
            | Self::Server { status, .. }
            | Self::RequestRejected { status, .. }
            | Self::Upstream { status, .. } => Some(*status),
            Self::RateLimitExceeded { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns the URL this error relates to, if any.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::HttpStatus { url, .. }
            | Self::TransientFetch { url, .. }
            | Self::RateLimitExceeded { url, .. }
            | Self::Server { url, .. }
            | Self::RequestRejected { url, .. }
            | Self::InvalidUrl { url }
            | Self::Decode { url, .. }
            | Self::MissingDataUrl { url } => Some(url),
            _ => None,
        }
    }
}

/// Classifies an HTTP status code into a failure kind.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        500 | 502 | 503 | 504 => FailureKind::ServerError,
        _ => FailureKind::Rejected,
    }
}
