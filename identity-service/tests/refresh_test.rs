mod common;

use axum::http::StatusCode;
use common::TestApp;
use serde_json::json;

const EMAIL: &str = "alice@example.com";

#[tokio::test]
async fn test_refresh_rotates_pair() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (_, refresh) = app.login_tokens(EMAIL).await;

    let response = app
        .post("/auth/refresh", json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let new_refresh = response.body["refresh_token"].as_str().unwrap();
    assert_ne!(new_refresh, refresh);

    let new_access = response.body["access_token"].as_str().unwrap();
    let session = app.get("/auth/session", Some(new_access)).await;
    assert_eq!(session.status, StatusCode::OK);
    assert_eq!(session.body["auth_method"], "password");
}

#[tokio::test]
async fn test_reuse_revokes_every_session() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (first_access, refresh) = app.login_tokens(EMAIL).await;

    let rotated = app
        .post("/auth/refresh", json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(rotated.status, StatusCode::OK);
    let second_access = rotated.body["access_token"].as_str().unwrap().to_string();
    let second_refresh = rotated.body["refresh_token"].as_str().unwrap().to_string();

    let replay = app
        .post("/auth/refresh", json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.error_kind(), "token_reuse_detected");

    for access in [&first_access, &second_access] {
        let session = app.get("/auth/session", Some(access)).await;
        assert_eq!(session.status, StatusCode::UNAUTHORIZED);
        assert_eq!(session.error_kind(), "token_revoked");
    }

    // The legitimate successor is gone too.
    let successor = app
        .post("/auth/refresh", json!({ "refresh_token": second_refresh }))
        .await;
    assert_eq!(successor.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_concurrent_double_refresh_has_one_winner() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (_, refresh) = app.login_tokens(EMAIL).await;
    let body = json!({ "refresh_token": refresh });

    let (a, b) = tokio::join!(
        app.post("/auth/refresh", body.clone()),
        app.post("/auth/refresh", body.clone()),
    );

    let mut statuses = [a.status, b.status];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::UNAUTHORIZED]);

    let loser = if a.status == StatusCode::OK { &b } else { &a };
    assert_eq!(loser.error_kind(), "token_reuse_detected");
}

#[tokio::test]
async fn test_access_token_cannot_refresh() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;

    let response = app
        .post("/auth/refresh", json!({ "refresh_token": access }))
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_kind(), "invalid_token_type");
}

#[tokio::test]
async fn test_garbage_refresh_token() {
    let app = TestApp::spawn().await;

    let response = app
        .post("/auth/refresh", json!({ "refresh_token": "not.a.jwt" }))
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_kind(), "malformed_token");
}

#[tokio::test]
async fn test_logout_revokes_both_tokens() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, refresh) = app.login_tokens(EMAIL).await;

    let response = app
        .post_authed("/auth/logout", json!({ "refresh_token": refresh }), &access)
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let session = app.get("/auth/session", Some(&access)).await;
    assert_eq!(session.status, StatusCode::UNAUTHORIZED);
    assert_eq!(session.error_kind(), "token_revoked");

    let refreshed = app
        .post("/auth/refresh", json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(refreshed.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_is_best_effort() {
    let app = TestApp::spawn().await;

    let empty = app.post("/auth/logout", json!({})).await;
    assert_eq!(empty.status, StatusCode::NO_CONTENT);

    let garbage = app
        .post("/auth/logout", json!({ "refresh_token": "garbage" }))
        .await;
    assert_eq!(garbage.status, StatusCode::NO_CONTENT);
}
