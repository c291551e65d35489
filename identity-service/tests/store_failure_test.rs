mod common;

use axum::http::StatusCode;
use common::TestApp;
use identity_service::config::{Environment, StoreFailurePolicy};

async fn app_with(policy: StoreFailurePolicy) -> TestApp {
    TestApp::spawn_with(|config| {
        config.store_failure_policy = policy;
        if policy == StoreFailurePolicy::FailClosed {
            config.environment = Environment::Prod;
        }
    })
    .await
}

#[tokio::test]
async fn test_fail_closed_rejects_protected_requests() {
    let app = app_with(StoreFailurePolicy::FailClosed).await;
    app.seed_user("alice@example.com");
    let (access, _) = app.login_tokens("alice@example.com").await;

    app.cache.set_available(false);

    let response = app.get("/auth/session", Some(&access)).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.error_kind(), "service_unavailable");
    assert!(response.headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_fail_open_lets_requests_through() {
    let app = app_with(StoreFailurePolicy::FailOpen).await;
    app.seed_user("alice@example.com");
    let (access, _) = app.login_tokens("alice@example.com").await;

    app.cache.set_available(false);

    let response = app.get("/auth/session", Some(&access)).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_fail_closed_refresh_is_unavailable() {
    let app = app_with(StoreFailurePolicy::FailClosed).await;
    app.seed_user("alice@example.com");
    let (_, refresh) = app.login_tokens("alice@example.com").await;

    app.cache.set_available(false);

    let response = app
        .post(
            "/auth/refresh",
            serde_json::json!({ "refresh_token": refresh }),
        )
        .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

    // Once the cache is back the token was never consumed.
    app.cache.set_available(true);
    let response = app
        .post(
            "/auth/refresh",
            serde_json::json!({ "refresh_token": refresh }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_cache_outage() {
    let app = app_with(StoreFailurePolicy::FailOpen).await;

    let healthy = app.get("/health", None).await;
    assert_eq!(healthy.status, StatusCode::OK);
    assert_eq!(healthy.body["status"], "healthy");
    assert_eq!(healthy.body["store_failure_policy"], "fail_open");

    app.cache.set_available(false);
    let degraded = app.get("/health", None).await;
    assert_eq!(degraded.status, StatusCode::SERVICE_UNAVAILABLE);
}
