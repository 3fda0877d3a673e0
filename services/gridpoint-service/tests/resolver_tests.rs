//! HTTP resolution tests against a mocked authority.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gridpoint_common::GeoPoint;
use gridpoint_service::config::ApiConfig;
use gridpoint_service::resolver::{
    CallError, HttpPointsApi, PointsApi, ResolutionClient, ResolveError, RetryPolicy,
};
use gridpoint_service::throttle::{Throttle, ThrottleConfig};
use test_utils::fixtures::responses;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Mock authority
// ============================================================================

fn api_config(base_url: &str) -> ApiConfig {
    ApiConfig {
        base_url: base_url.to_string(),
        ua_domain: "example.org".into(),
        ua_email: "ops@example.org".into(),
        timeout_secs: 5,
        connect_timeout_secs: 2,
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

fn throttle() -> Throttle {
    Throttle::new("test", ThrottleConfig::unpaced(4))
}

/// Mount a points answer for one rounded coordinate pair.
async fn mount_points(server: &MockServer, coords: &str, response: ResponseTemplate, calls: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/points/{coords}")))
        .respond_with(response)
        .expect(calls)
        .mount(server)
        .await;
}

fn not_found() -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(responses::not_found(10.0, -97.0))
}

fn server_error() -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_string("boom")
}

// ============================================================================
// Single calls
// ============================================================================

#[tokio::test]
async fn test_success_decodes_gridpoint_and_sends_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/points/39.7451,-97.0799"))
        .and(header("user-agent", "(example.org, ops@example.org)"))
        .and(header("accept", "application/geo+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(responses::topeka()))
        .expect(1)
        .mount(&server)
        .await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    let resolution = api.fetch_point(39.7451, -97.0799).await.unwrap();

    assert_eq!(resolution.gridpoint.to_string(), "TOP/32,81");
    assert_eq!(resolution.echoed, Some(GeoPoint::new(39.7451, -97.0799)));

    let metadata = &resolution.metadata;
    assert_eq!(
        metadata.forecast_url.as_deref(),
        Some("https://api.weather.gov/gridpoints/TOP/32,81/forecast")
    );
    assert_eq!(
        metadata.forecast_office_url.as_deref(),
        Some("https://api.weather.gov/offices/TOP")
    );
    assert_eq!(
        metadata.observation_stations_url.as_deref(),
        Some("https://api.weather.gov/gridpoints/TOP/32,81/stations")
    );
    assert_eq!(
        metadata.forecast_zone_url.as_deref(),
        Some("https://api.weather.gov/zones/forecast/KSZ024")
    );
    assert_eq!(metadata.time_zone.as_deref(), Some("America/Chicago"));
    assert_eq!(metadata.radar_station.as_deref(), Some("KTWX"));
}

#[tokio::test]
async fn test_url_is_rounded_to_four_decimals() {
    let server = MockServer::start().await;
    mount_points(
        &server,
        "39.7451,-97.0799",
        ResponseTemplate::new(200).set_body_json(responses::topeka()),
        1,
    )
    .await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    api.fetch_point(39.745_123_9, -97.079_949).await.unwrap();
}

#[tokio::test]
async fn test_not_found_is_rejected_with_detail() {
    let server = MockServer::start().await;
    mount_points(&server, "10.0000,-97.0000", not_found(), 1).await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    match api.fetch_point(10.0, -97.0).await {
        Err(CallError::Rejected { status, detail }) => {
            assert_eq!(status, 404);
            assert!(detail.starts_with("Unable to provide data"), "{}", detail);
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    mount_points(
        &server,
        "20.0000,-97.0000",
        ResponseTemplate::new(429)
            .insert_header("Retry-After", "0")
            .set_body_string("slow down"),
        1,
    )
    .await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    assert_eq!(
        api.fetch_point(20.0, -97.0).await.unwrap_err(),
        CallError::RateLimited {
            retry_after: Some(Duration::ZERO)
        }
    );
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    mount_points(&server, "30.0000,-97.0000", server_error(), 1).await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    assert!(matches!(
        api.fetch_point(30.0, -97.0).await,
        Err(CallError::Transient(_))
    ));
}

#[tokio::test]
async fn test_missing_field_is_malformed() {
    let server = MockServer::start().await;
    mount_points(
        &server,
        "40.0000,-97.0000",
        ResponseTemplate::new(200).set_body_json(responses::missing_grid_x()),
        1,
    )
    .await;

    let api = HttpPointsApi::new(&api_config(&server.uri())).unwrap();
    match api.fetch_point(40.0, -97.0).await {
        Err(CallError::Malformed(msg)) => assert!(msg.contains("gridX"), "{}", msg),
        other => panic!("expected Malformed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpPointsApi::new(&api_config(&format!("http://{}", addr))).unwrap();
    assert!(matches!(
        api.fetch_point(39.7451, -97.0799).await,
        Err(CallError::Transient(_))
    ));
}

// ============================================================================
// Retrying client
// ============================================================================

#[tokio::test]
async fn test_client_retries_after_rate_limit() {
    let server = MockServer::start().await;
    // First answer is a 429; once used up, the 200 below takes over
    Mock::given(method("GET"))
        .and(path("/points/20.0000,-97.0000"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_points(
        &server,
        "20.0000,-97.0000",
        ResponseTemplate::new(200).set_body_json(responses::points("ICT", 60, 40, 20.0, -97.0)),
        1,
    )
    .await;

    let client = ResolutionClient::from_config(&api_config(&server.uri())).unwrap();
    let throttle = Throttle::new("test", ThrottleConfig::unpaced(4));

    let resolution = client
        .resolve(GeoPoint::new(20.0, -97.0), &throttle)
        .await
        .unwrap();

    assert_eq!(resolution.gridpoint.to_string(), "ICT/60,40");
    // A 429 halves the concurrency limit
    assert_eq!(throttle.limit(), 2);
}

#[tokio::test]
async fn test_client_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    mount_points(&server, "30.0000,-97.0000", server_error(), 3).await;

    let client = ResolutionClient::from_config(&api_config(&server.uri())).unwrap();
    let err = client
        .resolve(GeoPoint::new(30.0, -97.0), &throttle())
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::Exhausted { attempts: 3, .. }));
    assert_eq!(err.kind(), "exhausted");
}

#[tokio::test]
async fn test_client_does_not_retry_permanent_failures() {
    let server = MockServer::start().await;
    mount_points(&server, "10.0000,-97.0000", not_found(), 1).await;
    mount_points(
        &server,
        "40.0000,-97.0000",
        ResponseTemplate::new(200).set_body_json(responses::missing_grid_x()),
        1,
    )
    .await;

    let client = ResolutionClient::from_config(&api_config(&server.uri())).unwrap();
    let err = client
        .resolve(GeoPoint::new(10.0, -97.0), &throttle())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Rejected { status: 404, .. }));

    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
    };
    let api = Arc::new(HttpPointsApi::new(&api_config(&server.uri())).unwrap());
    let client = ResolutionClient::new(api, policy);
    let err = client
        .resolve(GeoPoint::new(40.0, -97.0), &throttle())
        .await
        .unwrap_err();
    assert!(err.is_permanent());
}
