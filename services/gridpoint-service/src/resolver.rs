//! Resolution client for the authority's points endpoint.
//!
//! `GET {base}/points/{lat},{lon}` answers which forecast gridpoint covers a
//! coordinate. The raw call sits behind the `PointsApi` trait; the
//! `ResolutionClient` wraps it with throttling, bounded retry with
//! exponential backoff and full jitter, and error classification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gridpoint_common::{GeoPoint, GridpointId, PointMetadata};
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::metrics;
use crate::throttle::Throttle;

/// A successful points lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResolution {
    pub gridpoint: GridpointId,
    pub metadata: PointMetadata,
    /// The point the authority says it answered for, when it says.
    pub echoed: Option<GeoPoint>,
}

/// Outcome of a single raw call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("rejected with HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Final outcome of a resolution after retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected with HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("throttle closed")]
    ThrottleClosed,
}

impl ResolveError {
    /// Failure kind as persisted with the run.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Malformed(_) => "malformed",
            ResolveError::Rejected { .. } => "rejected",
            ResolveError::Exhausted { .. } => "exhausted",
            ResolveError::ThrottleClosed => "cancelled",
        }
    }

    /// Permanent errors are not worth retrying until the authority changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResolveError::Malformed(_) | ResolveError::Rejected { .. })
    }
}

/// One raw call to the points endpoint.
#[async_trait]
pub trait PointsApi: Send + Sync {
    async fn fetch_point(&self, lat: f64, lon: f64) -> Result<PointResolution, CallError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// reqwest-backed `PointsApi`.
pub struct HttpPointsApi {
    client: Client,
    base_url: String,
}

impl HttpPointsApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/geo+json"),
        );

        let client = Client::builder()
            .user_agent(config.user_agent())
            .default_headers(headers)
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn points_url(&self, lat: f64, lon: f64) -> String {
        points_url(&self.base_url, lat, lon)
    }
}

/// The authority redirects requests with more than four decimals.
pub fn points_url(base_url: &str, lat: f64, lon: f64) -> String {
    format!("{}/points/{:.4},{:.4}", base_url.trim_end_matches('/'), lat, lon)
}

#[async_trait]
impl PointsApi for HttpPointsApi {
    async fn fetch_point(&self, lat: f64, lon: f64) -> Result<PointResolution, CallError> {
        let url = self.points_url(lat, lon);
        debug!(url = %url, "Requesting points");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CallError::RateLimited { retry_after });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(CallError::Transient(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(CallError::Rejected {
                status: status.as_u16(),
                detail: problem_detail(&body),
            });
        }

        parse_points_body(&body)
    }
}

// ============================================================================
// Response decoding
// ============================================================================

#[derive(Debug, Deserialize)]
struct PointsResponse {
    properties: Option<PointsProperties>,
    geometry: Option<PointGeometry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointsProperties {
    grid_id: Option<String>,
    grid_x: Option<i64>,
    grid_y: Option<i64>,
    forecast: Option<String>,
    forecast_hourly: Option<String>,
    forecast_office: Option<String>,
    forecast_grid_data: Option<String>,
    observation_stations: Option<String>,
    forecast_zone: Option<String>,
    time_zone: Option<String>,
    radar_station: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointGeometry {
    coordinates: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct Problem {
    title: Option<String>,
    detail: Option<String>,
}

/// Decode and validate a 200 response body.
pub fn parse_points_body(body: &[u8]) -> Result<PointResolution, CallError> {
    let parsed: PointsResponse =
        serde_json::from_slice(body).map_err(|e| CallError::Malformed(e.to_string()))?;

    let props = parsed
        .properties
        .ok_or_else(|| CallError::Malformed("missing properties".into()))?;
    let office = props
        .grid_id
        .ok_or_else(|| CallError::Malformed("missing properties.gridId".into()))?;
    let x = props
        .grid_x
        .ok_or_else(|| CallError::Malformed("missing properties.gridX".into()))?;
    let y = props
        .grid_y
        .ok_or_else(|| CallError::Malformed("missing properties.gridY".into()))?;

    let gridpoint =
        GridpointId::from_raw(&office, x, y).map_err(|e| CallError::Malformed(e.to_string()))?;

    // GeoJSON positions are [lon, lat]
    let echoed = parsed
        .geometry
        .and_then(|g| g.coordinates)
        .filter(|c| c.len() >= 2)
        .map(|c| GeoPoint::new(c[1], c[0]));

    Ok(PointResolution {
        gridpoint,
        metadata: PointMetadata {
            forecast_url: props.forecast,
            forecast_hourly_url: props.forecast_hourly,
            forecast_office_url: props.forecast_office,
            forecast_grid_data_url: props.forecast_grid_data,
            observation_stations_url: props.observation_stations,
            forecast_zone_url: props.forecast_zone,
            time_zone: props.time_zone,
            radar_station: props.radar_station,
        },
        echoed,
    })
}

fn problem_detail(body: &[u8]) -> String {
    match serde_json::from_slice::<Problem>(body) {
        Ok(Problem {
            detail: Some(detail),
            ..
        }) => detail,
        Ok(Problem {
            title: Some(title),
            ..
        }) => title,
        _ => String::from_utf8_lossy(body).chars().take(200).collect(),
    }
}

// ============================================================================
// Retrying client
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first; at least one is always made.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retrying, throttled resolution of a coordinate.
pub struct ResolutionClient {
    api: Arc<dyn PointsApi>,
    policy: RetryPolicy,
}

impl ResolutionClient {
    pub fn new(api: Arc<dyn PointsApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    /// Build the production client from configuration.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let api = HttpPointsApi::new(config)?;
        Ok(Self::new(Arc::new(api), config.retry_policy()))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolve one point. Every attempt goes through `throttle`.
    pub async fn resolve(
        &self,
        point: GeoPoint,
        throttle: &Throttle,
    ) -> Result<PointResolution, ResolveError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = {
                let _permit = throttle
                    .acquire()
                    .await
                    .map_err(|_| ResolveError::ThrottleClosed)?;
                self.api.fetch_point(point.lat, point.lon).await
            };

            let (last, delay) = match result {
                Ok(resolution) => {
                    throttle.on_success();
                    metrics::record_resolve_attempt("success");
                    return Ok(resolution);
                }
                Err(CallError::Malformed(msg)) => {
                    metrics::record_resolve_attempt("malformed");
                    return Err(ResolveError::Malformed(msg));
                }
                Err(CallError::Rejected { status, detail }) => {
                    metrics::record_resolve_attempt("rejected");
                    return Err(ResolveError::Rejected { status, detail });
                }
                Err(CallError::RateLimited { retry_after }) => {
                    throttle.on_rate_limited();
                    metrics::record_resolve_attempt("rate_limited");
                    let delay = retry_after
                        .map(|d| d.min(self.policy.max_backoff))
                        .unwrap_or_else(|| full_jitter(backoff));
                    ("HTTP 429".to_string(), delay)
                }
                Err(CallError::Transient(msg)) => {
                    metrics::record_resolve_attempt("transient");
                    (msg, full_jitter(backoff))
                }
            };

            if attempt >= max_attempts {
                return Err(ResolveError::Exhausted {
                    attempts: attempt,
                    last,
                });
            }

            warn!(
                lat = point.lat,
                lon = point.lon,
                error = %last,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Points request failed, retrying"
            );

            tokio::time::sleep(delay).await;
            backoff = std::cmp::min(backoff * 2, self.policy.max_backoff);
        }
    }
}

/// Uniform delay in `[0, ceiling]`.
fn full_jitter(ceiling: Duration) -> Duration {
    let ceiling_ms = ceiling.as_millis() as u64;
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
}
