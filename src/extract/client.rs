//! Explicitly constructed client owning the shared limiter and transport.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::batch::RangeBatcher;
use super::constants::{DEFAULT_BASE_URL, DEFAULT_MAX_SPAN_MONTHS};
use super::error::FetchError;
use super::executor::RequestExecutor;
use super::rate_limiter::{Limiter, RateLimitConfig, RateLimiterStats, SlidingWindowLimiter};
use super::record::DailyRecord;
use super::retry::{RetryPolicy, StatusAwareRetrier};
use super::transport::{PoolConfig, PoolStats, PooledTransport, Transport};
use crate::station::{RawStation, StationId, StationInventory, StationResolver};

/// Environment variable holding the upstream API key.
pub const API_KEY_ENV: &str = "AEMET_API_KEY";

/// Input date format for [`ClimateClient::fetch_daily_records`].
const INPUT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Everything a [`ClimateClient`] is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// API root, without trailing slash.
    pub base_url: String,
    /// Key sent in the `api_key` header.
    pub api_key: Option<String>,
    /// Sliding-window budget shared by every call.
    pub rate_limit: RateLimitConfig,
    /// Connection pool and transport-level retry settings.
    pub pool: PoolConfig,
    /// Status-aware retry policy.
    pub retry: RetryPolicy,
    /// Largest window a single data request may cover.
    pub max_span_months: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            rate_limit: RateLimitConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::http_status(),
            max_span_months: DEFAULT_MAX_SPAN_MONTHS,
        }
    }
}

impl ClientConfig {
    /// Defaults plus the API key from `AEMET_API_KEY`, when set and non-empty.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV)
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            ..Self::default()
        }
    }
}

/// Client for the upstream climatological API.
///
/// Holds the one limiter and one connection pool every extraction run shares.
/// Wrap it in `Arc` to run extractions for several stations concurrently.
///
/// # Example
///
/// ```no_run
/// use climate_extract::extract::{ClientConfig, ClimateClient};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClimateClient::new(ClientConfig::from_env())?;
/// let records = client
///     .fetch_daily_records("5790Y", "2020-01-01", "2021-06-30", &CancellationToken::new())
///     .await?;
/// println!("{} days", records.len());
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClimateClient {
    config: ClientConfig,
    limiter: Arc<SlidingWindowLimiter>,
    transport: Arc<PooledTransport>,
    executor: RequestExecutor,
    inventory: RwLock<Option<Arc<StationInventory>>>,
}

impl ClimateClient {
    /// Builds the limiter, pool and executor described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if the HTTP client cannot be
    /// created, or [`FetchError::InvalidInput`] for an unusable API key or
    /// base URL.
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        url::Url::parse(&config.base_url)
            .map_err(|_| FetchError::invalid_url(config.base_url.clone()))?;

        let limiter = Arc::new(SlidingWindowLimiter::from_config(config.rate_limit));
        let transport = Arc::new(PooledTransport::new(config.pool.clone())?);

        let mut executor = RequestExecutor::new(
            Arc::clone(&limiter) as Arc<dyn Limiter>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            StatusAwareRetrier::new(config.retry.clone()),
        );
        if let Some(key) = &config.api_key {
            executor = executor.with_api_key(key)?;
        } else {
            warn!("no API key configured; upstream will reject requests");
        }

        Ok(Self {
            config,
            limiter,
            transport,
            executor,
            inventory: RwLock::new(None),
        })
    }

    /// Returns the configuration the client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetches daily records for `station_id` over the inclusive range
    /// `start..=end`, both `YYYY-MM-DD`.
    ///
    /// Records carry the station's coordinates when the inventory has been
    /// loaded on this client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidInput`] for a blank station, unparseable
    /// dates or `start > end`, and otherwise the errors of
    /// [`fetch_range`](Self::fetch_range).
    pub async fn fetch_daily_records(
        &self,
        station_id: &str,
        start: &str,
        end: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DailyRecord>, FetchError> {
        let station = StationId::new(station_id);
        if station.as_str().is_empty() {
            return Err(FetchError::invalid_input("station id must not be empty"));
        }
        let start = parse_input_date(start)?;
        let end = parse_input_date(end)?;
        self.fetch_range(&station, start, end, cancel).await
    }

    /// Fetches daily records for `station` over `start..=end`, splitting the
    /// range into windows of the configured maximum span.
    ///
    /// # Errors
    ///
    /// See [`RangeBatcher::fetch_range`].
    #[instrument(skip(self, cancel), fields(station = %station))]
    pub async fn fetch_range(
        &self,
        station: &StationId,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<DailyRecord>, FetchError> {
        let coords = self
            .cached_inventory()
            .and_then(|inventory| inventory.coordinates(station));

        RangeBatcher::new(self.executor.clone(), &self.config.base_url)
            .with_coordinates(coords)
            .fetch_range(
                station.as_str(),
                start,
                end,
                self.config.max_span_months,
                cancel,
            )
            .await
    }

    /// Downloads the full station inventory and caches it on the client.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestExecutor::fetch_payload`].
    #[instrument(skip_all)]
    pub async fn fetch_station_inventory(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<StationInventory>, FetchError> {
        let url = format!(
            "{}/valores/climatologicos/inventarioestaciones/todasestaciones",
            self.config.base_url.trim_end_matches('/')
        );
        let raw: Vec<RawStation> = self
            .executor
            .fetch_payload(&url, "station inventory", cancel)
            .await?
            .unwrap_or_default();

        let inventory = Arc::new(StationInventory::from_raw(raw));
        info!(stations = inventory.len(), "station inventory loaded");
        *self
            .inventory
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&inventory));
        Ok(inventory)
    }

    /// Returns the cached inventory, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns any error of [`fetch_station_inventory`](Self::fetch_station_inventory).
    pub async fn station_inventory(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<StationInventory>, FetchError> {
        match self.cached_inventory() {
            Some(inventory) => Ok(inventory),
            None => self.fetch_station_inventory(cancel).await,
        }
    }

    /// Resolves the station nearest to `(lat, lon)`.
    ///
    /// # Errors
    ///
    /// Returns any error of [`station_inventory`](Self::station_inventory).
    pub async fn resolve_station(
        &self,
        lat: f64,
        lon: f64,
        cancel: &CancellationToken,
    ) -> Result<Option<StationId>, FetchError> {
        let inventory = self.station_inventory(cancel).await?;
        Ok(inventory.resolve(lat, lon))
    }

    /// Snapshot of the shared rate limiter.
    #[must_use]
    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    /// Snapshot of the connection pool.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.transport.pool_stats()
    }

    /// Releases pooled connections. Later calls fail with
    /// [`FetchError::TransportClosed`].
    pub fn close(&self) {
        self.transport.close();
    }

    fn cached_inventory(&self) -> Option<Arc<StationInventory>> {
        self.inventory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn parse_input_date(value: &str) -> Result<NaiveDate, FetchError> {
    NaiveDate::parse_from_str(value.trim(), INPUT_DATE_FORMAT).map_err(|_| {
        FetchError::invalid_input(format!("invalid date '{value}', expected YYYY-MM-DD"))
    })
}
