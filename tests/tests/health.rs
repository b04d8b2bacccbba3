//! Tests for the banner and health check endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::setup::test_router;
use telemetry::health;

/// Test / answers with the service banner
#[tokio::test]
async fn test_index_banner() {
    let server = TestServer::new(test_router()).expect("Failed to create test server");

    let response = server.get("/").await;
    response.assert_status_ok();
    assert!(response.text().contains("queue-ingest is online!"));
}

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let server = TestServer::new(test_router()).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();

    for field in ["status", "service", "queue", "table", "broker", "database", "metrics"] {
        assert!(body.get(field).is_some(), "Response should have '{}' field", field);
    }
    assert_eq!(body["queue"], "postgres");
    assert_eq!(body["table"], "records");
    assert!(body["broker"].get("connected").is_some());
    assert!(body["metrics"].get("messages_received").is_some());

    let status = body["status"].as_str().unwrap_or("");
    assert!(
        status == "healthy" || status == "degraded" || status == "unhealthy",
        "Status should be 'healthy', 'degraded', or 'unhealthy', got '{}'",
        status
    );
}

/// Test /health/ready follows the broker connection state
#[tokio::test]
async fn test_ready_endpoint_tracks_broker() {
    let server = TestServer::new(test_router()).expect("Failed to create test server");

    health().broker.set_disconnected("test");
    let response = server.get("/health/ready").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    health().broker.set_connected();
    let response = server.get("/health/ready").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["broker"]["connected"], true);
    assert_eq!(body["broker"]["state"], "connected");
}

/// Test /health/live endpoint always returns 200 when service is running
#[tokio::test]
async fn test_live_endpoint() {
    let server = TestServer::new(test_router()).expect("Failed to create test server");

    let response = server.get("/health/live").await;
    response.assert_status_ok();
}
