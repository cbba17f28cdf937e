//! Splitting long date ranges into upstream-sized windows.
//!
//! The daily-values endpoint caps how much history one request may cover, so
//! [`RangeBatcher`] walks the requested interval in windows of at most
//! `max_span_months`, performs the two-step fetch for each, and concatenates
//! the results in chronological order. A window that fails is logged and
//! skipped so the rest of the run still produces data.

use chrono::{Days, Months, NaiveDate};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::FetchError;
use super::executor::RequestExecutor;
use super::record::{DailyRecord, parse_records};

/// Date format the upstream expects in request paths.
const UPSTREAM_DATE_FORMAT: &str = "%Y-%m-%dT00:00:00UTC";

/// One inclusive sub-interval of a [`BatchPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpan {
    /// First day.
    pub start: NaiveDate,
    /// Last day, inclusive.
    pub end: NaiveDate,
}

impl std::fmt::Display for DateSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Contiguous, non-overlapping, ordered windows covering `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    spans: Vec<DateSpan>,
}

impl BatchPlan {
    /// Plans windows of at most `max_span_months` calendar months.
    ///
    /// Each window ends the day before the same day-of-month `max_span_months`
    /// later, clamped to `end`.
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use climate_extract::extract::BatchPlan;
    ///
    /// let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
    /// let plan = BatchPlan::new(d(2020, 1, 1), d(2021, 6, 30), 6).unwrap();
    /// assert_eq!(plan.len(), 3);
    /// assert_eq!(plan.spans()[0].end, d(2020, 6, 30));
    /// assert_eq!(plan.spans()[2].start, d(2021, 1, 1));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidInput`] if `start > end` or
    /// `max_span_months` is zero.
    pub fn new(start: NaiveDate, end: NaiveDate, max_span_months: u32) -> Result<Self, FetchError> {
        if start > end {
            return Err(FetchError::invalid_input(format!(
                "start date {start} is after end date {end}"
            )));
        }
        if max_span_months == 0 {
            return Err(FetchError::invalid_input("max span must be at least one month"));
        }

        let mut spans = Vec::new();
        let mut cursor = start;
        loop {
            let span_end = cursor
                .checked_add_months(Months::new(max_span_months))
                .and_then(|next| next.checked_sub_days(Days::new(1)))
                .map_or(end, |last| last.min(end));
            spans.push(DateSpan {
                start: cursor,
                end: span_end,
            });
            match span_end.checked_add_days(Days::new(1)) {
                Some(next) if span_end < end => cursor = next,
                _ => break,
            }
        }

        Ok(Self { spans })
    }

    /// The planned windows, oldest first.
    #[must_use]
    pub fn spans(&self) -> &[DateSpan] {
        &self.spans
    }

    /// Number of windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Always false; a plan covers at least one day.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Whether the whole range fits a single request.
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.spans.len() == 1
    }
}

/// Calendar months between the months of `start` and `end` (days ignored).
#[must_use]
pub fn months_between(start: NaiveDate, end: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(end.year() - start.year()) * 12 + i64::from(end.month()) - i64::from(start.month())
}

/// Fetches daily records for one station over an arbitrary range.
#[derive(Debug, Clone)]
pub struct RangeBatcher {
    executor: RequestExecutor,
    base_url: String,
    coords: Option<(f64, f64)>,
}

impl RangeBatcher {
    /// Creates a batcher issuing requests below `base_url`.
    #[must_use]
    pub fn new(executor: RequestExecutor, base_url: impl Into<String>) -> Self {
        Self {
            executor,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            coords: None,
        }
    }

    /// Stamps `(lat, lon)` on every record produced.
    #[must_use]
    pub fn with_coordinates(mut self, coords: Option<(f64, f64)>) -> Self {
        self.coords = coords;
        self
    }

    /// Daily-values URL for `station_id` over `span`.
    #[must_use]
    pub fn window_url(&self, station_id: &str, span: DateSpan) -> String {
        format!(
            "{}/valores/climatologicos/diarios/datos/fechaini/{}/fechafin/{}/estacion/{}",
            self.base_url,
            span.start.format(UPSTREAM_DATE_FORMAT),
            span.end.format(UPSTREAM_DATE_FORMAT),
            station_id
        )
    }

    /// Fetches `[start, end]` for `station_id`, oldest record first.
    ///
    /// A range that fits one window is fetched directly and any failure is
    /// returned. Longer ranges skip windows that fail; the last error is
    /// returned only when every window failed.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidInput`] for an inverted range or zero span
    /// - [`FetchError::Cancelled`] when `cancel` fires
    /// - the window error as described above
    #[instrument(skip(self, cancel), fields(windows = tracing::field::Empty))]
    pub async fn fetch_range(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        max_span_months: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<DailyRecord>, FetchError> {
        let plan = BatchPlan::new(start, end, max_span_months)?;
        tracing::Span::current().record("windows", plan.len());
        debug!(
            months = months_between(start, end),
            windows = plan.len(),
            "planned extraction"
        );

        if plan.is_single() {
            return self.fetch_window(station_id, plan.spans()[0], cancel).await;
        }

        let mut records = Vec::new();
        let mut failed = 0;
        let mut last_error = None;
        for (index, span) in plan.spans().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.fetch_window(station_id, *span, cancel).await {
                Ok(window) => records.extend(window),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(error) => {
                    warn!(
                        station_id,
                        window = index + 1,
                        of = plan.len(),
                        span = %span,
                        error = %error,
                        "skipping failed window"
                    );
                    failed += 1;
                    last_error = Some(error);
                }
            }
        }

        if failed == plan.len() {
            if let Some(error) = last_error {
                return Err(error);
            }
        }

        info!(
            station_id,
            records = records.len(),
            windows = plan.len(),
            failed,
            "extraction finished"
        );
        Ok(records)
    }

    async fn fetch_window(
        &self,
        station_id: &str,
        span: DateSpan,
        cancel: &CancellationToken,
    ) -> Result<Vec<DailyRecord>, FetchError> {
        let url = self.window_url(station_id, span);
        let description = format!("daily values for {station_id} ({span})");

        let raw: Vec<Value> = self
            .executor
            .fetch_payload(&url, &description, cancel)
            .await?
            .unwrap_or_default();

        let mut records = parse_records(&raw, station_id, self.coords);
        if records.is_empty() {
            warn!(station_id, span = %span, "no data available for window");
        }
        records.sort_by_key(|record| record.date);
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::extract::executor::MockTransport;
    use crate::extract::rate_limiter::{Limiter, SlidingWindowLimiter};
    use crate::extract::retry::{RetryPolicy, StatusAwareRetrier};
    use crate::extract::transport::Transport;

    const BASE: &str = "http://api.test/opendata/api";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn batcher(transport: &Arc<MockTransport>) -> RangeBatcher {
        let executor = RequestExecutor::new(
            Arc::new(SlidingWindowLimiter::new(90, Duration::from_secs(60))) as Arc<dyn Limiter>,
            Arc::clone(transport) as Arc<dyn Transport>,
            StatusAwareRetrier::new(RetryPolicy::http_status().with_jitter(false)),
        );
        RangeBatcher::new(executor, BASE)
    }

    /// Scripts one successful two-step cycle for `span`.
    fn script_window(transport: &MockTransport, batcher: &RangeBatcher, span: DateSpan, days: &[&str]) {
        let data_url = format!("http://data.test/{}", span.start);
        transport.push_json(
            &batcher.window_url("5790Y", span),
            200,
            &json!({"estado": 200, "descripcion": "exito", "datos": data_url}),
        );
        let rows: Vec<_> = days.iter().map(|day| json!({"fecha": day, "tmed": "10,0"})).collect();
        transport.push_json(&data_url, 200, &json!(rows));
    }

    // ==================== BatchPlan Tests ====================

    #[test]
    fn test_plan_single_window_when_range_fits() {
        let plan = BatchPlan::new(d(2020, 1, 1), d(2020, 6, 30), 6).unwrap();
        assert!(plan.is_single());
        assert_eq!(plan.spans()[0], DateSpan { start: d(2020, 1, 1), end: d(2020, 6, 30) });
    }

    #[test]
    fn test_plan_single_day() {
        let plan = BatchPlan::new(d(2020, 3, 3), d(2020, 3, 3), 6).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.spans()[0].end, d(2020, 3, 3));
    }

    #[test]
    fn test_plan_eighteen_months_in_three_windows() {
        let plan = BatchPlan::new(d(2020, 1, 1), d(2021, 6, 30), 6).unwrap();
        assert_eq!(
            plan.spans(),
            &[
                DateSpan { start: d(2020, 1, 1), end: d(2020, 6, 30) },
                DateSpan { start: d(2020, 7, 1), end: d(2020, 12, 31) },
                DateSpan { start: d(2021, 1, 1), end: d(2021, 6, 30) },
            ]
        );
    }

    #[test]
    fn test_plan_clamps_last_window_and_handles_month_ends() {
        let plan = BatchPlan::new(d(2019, 8, 31), d(2020, 3, 15), 6).unwrap();
        assert_eq!(plan.spans()[0], DateSpan { start: d(2019, 8, 31), end: d(2020, 2, 28) });
        assert_eq!(plan.spans()[1], DateSpan { start: d(2020, 2, 29), end: d(2020, 3, 15) });
    }

    #[test]
    fn test_plan_partition_properties() {
        let starts = [d(2019, 1, 1), d(2019, 1, 31), d(2020, 2, 29), d(2021, 11, 15)];
        let lengths = [0_u64, 1, 27, 180, 181, 365, 1000];
        for start in starts {
            for length in lengths {
                let end = start + Days::new(length);
                for months in [1, 3, 6, 12] {
                    let plan = BatchPlan::new(start, end, months).unwrap();
                    let spans = plan.spans();
                    assert_eq!(spans.first().unwrap().start, start);
                    assert_eq!(spans.last().unwrap().end, end);
                    for span in spans {
                        assert!(span.start <= span.end, "{span}");
                        let limit = span.start.checked_add_months(Months::new(months)).unwrap();
                        assert!(span.end < limit, "{span} exceeds {months} months");
                    }
                    for pair in spans.windows(2) {
                        assert_eq!(pair[0].end + Days::new(1), pair[1].start);
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_rejects_bad_input() {
        assert!(matches!(
            BatchPlan::new(d(2020, 2, 1), d(2020, 1, 1), 6),
            Err(FetchError::InvalidInput { .. })
        ));
        assert!(matches!(
            BatchPlan::new(d(2020, 1, 1), d(2020, 2, 1), 0),
            Err(FetchError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_months_between() {
        assert_eq!(months_between(d(2020, 1, 1), d(2021, 6, 30)), 17);
        assert_eq!(months_between(d(2020, 1, 31), d(2020, 2, 1)), 1);
        assert_eq!(months_between(d(2020, 5, 1), d(2020, 5, 31)), 0);
    }

    // ==================== RangeBatcher Tests ====================

    #[test]
    fn test_window_url_format() {
        let transport = Arc::new(MockTransport::default());
        let url = batcher(&transport).window_url(
            "5790Y",
            DateSpan { start: d(2020, 1, 1), end: d(2020, 6, 30) },
        );
        assert_eq!(
            url,
            "http://api.test/opendata/api/valores/climatologicos/diarios/datos/fechaini/2020-01-01T00:00:00UTC/fechafin/2020-06-30T00:00:00UTC/estacion/5790Y"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_three_windows_sorted() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport).with_coordinates(Some((37.8, -3.8)));
        let plan = BatchPlan::new(d(2020, 1, 1), d(2021, 6, 30), 6).unwrap();
        script_window(&transport, &batcher, plan.spans()[0], &["2020-01-02", "2020-01-01"]);
        script_window(&transport, &batcher, plan.spans()[1], &["2020-07-01"]);
        script_window(&transport, &batcher, plan.spans()[2], &["2021-06-30"]);

        let records = batcher
            .fetch_range("5790Y", d(2020, 1, 1), d(2021, 6, 30), 6, &CancellationToken::new())
            .await
            .unwrap();

        let days: Vec<_> = records.iter().map(|r| r.date.to_string()).collect();
        assert_eq!(days, vec!["2020-01-01", "2020-01-02", "2020-07-01", "2021-06-30"]);
        assert!(records.iter().all(|r| r.lat == Some(37.8) && r.station_id == "5790Y"));
        assert_eq!(transport.requests().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_skips_failed_middle_window() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport);
        let plan = BatchPlan::new(d(2020, 1, 1), d(2021, 6, 30), 6).unwrap();
        script_window(&transport, &batcher, plan.spans()[0], &["2020-01-01"]);
        // Window 2 is unscripted: the mock answers 404.
        script_window(&transport, &batcher, plan.spans()[2], &["2021-01-01"]);

        let records = batcher
            .fetch_range("5790Y", d(2020, 1, 1), d(2021, 6, 30), 6, &CancellationToken::new())
            .await
            .unwrap();

        let days: Vec<_> = records.iter().map(|r| r.date.to_string()).collect();
        assert_eq!(days, vec!["2020-01-01", "2021-01-01"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_all_windows_failed_returns_last_error() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport);

        let err = batcher
            .fetch_range("5790Y", d(2020, 1, 1), d(2021, 6, 30), 6, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RequestRejected { status: 404, ref url } if url.contains("2021-01-01")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_single_window_propagates_error() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport);
        let span = DateSpan { start: d(2020, 1, 1), end: d(2020, 1, 31) };
        transport.push_json(
            &batcher.window_url("5790Y", span),
            200,
            &json!({"estado": 429, "descripcion": "Limite de peticiones excedido"}),
        );

        let err = batcher
            .fetch_range("5790Y", span.start, span.end, 6, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Upstream { status: 429, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_empty_window_is_not_an_error() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport);
        let span = DateSpan { start: d(2020, 1, 1), end: d(2020, 1, 31) };
        transport.push_json(
            &batcher.window_url("5790Y", span),
            200,
            &json!({"estado": 404, "descripcion": "No hay datos"}),
        );

        let records = batcher
            .fetch_range("5790Y", span.start, span.end, 6, &CancellationToken::new())
            .await
            .unwrap();

        assert!(records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_range_cancelled_stops_walk() {
        let transport = Arc::new(MockTransport::default());
        let batcher = batcher(&transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = batcher
            .fetch_range("5790Y", d(2020, 1, 1), d(2021, 6, 30), 6, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert!(transport.requests().is_empty());
    }
}
