//! Shared helpers for integration tests: fast client configs and mocks of the
//! upstream two-step protocol.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use climate_extract::extract::{ClientConfig, PoolConfig, RateLimitConfig, RetryPolicy};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Upstream-style date used in request paths.
pub fn upstream_date(day: &str) -> String {
    format!("{day}T00:00:00UTC")
}

/// Path of the daily-values endpoint for one window.
pub fn window_path(station: &str, start: &str, end: &str) -> String {
    format!(
        "/api/valores/climatologicos/diarios/datos/fechaini/{}/fechafin/{}/estacion/{station}",
        upstream_date(start),
        upstream_date(end)
    )
}

/// Path of the station inventory endpoint.
pub const INVENTORY_PATH: &str = "/api/valores/climatologicos/inventarioestaciones/todasestaciones";

/// Client config pointed at `server` with millisecond retry delays and no
/// transport-level retries, so each upstream answer reaches the retrier.
pub fn fast_config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        base_url: format!("{}/api", server.uri()),
        api_key: Some("test-key".to_string()),
        rate_limit: RateLimitConfig {
            max_requests: 1000,
            window: Duration::from_secs(60),
        },
        pool: PoolConfig {
            max_retries: 0,
            ..PoolConfig::default()
        },
        retry: RetryPolicy::http_status()
            .with_jitter(false)
            .with_delays(Duration::from_millis(10), Duration::from_millis(100))
            .with_rate_limited_base_delay(Duration::from_millis(40)),
        max_span_months: 6,
    }
}

/// One raw upstream daily record.
pub fn raw_day(fecha: &str, tmed: &str) -> Value {
    json!({
        "fecha": fecha,
        "indicativo": "5790Y",
        "tmed": tmed,
        "tmin": "1,0",
        "tmax": "20,0",
        "prec": "0,0",
        "hrMedia": "60"
    })
}

/// Mounts the metadata and data endpoints of one window, each expected once.
pub async fn mount_window(server: &MockServer, metadata_path: &str, data_name: &str, rows: Value) {
    let data_path = format!("/data/{data_name}");
    Mock::given(method("GET"))
        .and(path(metadata_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "descripcion": "exito",
            "estado": 200,
            "datos": format!("{}{data_path}", server.uri()),
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(data_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .expect(1)
        .mount(server)
        .await;
}

/// Responder that answers `failures` with `status` first, then `success`.
pub struct FlakyResponder {
    count: Arc<AtomicUsize>,
    failures: usize,
    status: u16,
    success: Value,
}

impl FlakyResponder {
    pub fn new(failures: usize, status: u16, success: Value) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            failures,
            status,
            success,
        }
    }

    /// Shared counter of requests seen.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let seen = self.count.fetch_add(1, Ordering::SeqCst);
        if seen < self.failures {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200).set_body_json(self.success.clone())
        }
    }
}
