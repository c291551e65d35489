mod common;

use axum::http::StatusCode;
use common::{totp_code, TestApp, PASSWORD};
use serde_json::json;

#[tokio::test]
async fn test_login_without_mfa_returns_pair() {
    let app = TestApp::spawn().await;
    let alice = app.seed_user("alice@example.com");

    let response = app.login("alice@example.com").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["token_type"], "Bearer");
    assert!(response.body["expires_in"].as_i64().unwrap() > 0);
    assert!(response.body.get("requires_mfa").is_none());

    let access = response.body["access_token"].as_str().unwrap();
    let session = app.get("/auth/session", Some(access)).await;
    assert_eq!(session.status, StatusCode::OK);
    assert_eq!(session.body["sub"], alice.user_id.to_string());
    assert_eq!(session.body["auth_method"], "password");
    assert_eq!(session.body["token_type"], "access");
}

#[tokio::test]
async fn test_bad_credentials_do_not_reveal_the_account() {
    let app = TestApp::spawn().await;
    app.seed_user("alice@example.com");

    let wrong_password = app
        .post(
            "/auth/login",
            json!({ "email": "alice@example.com", "password": "not the password" }),
        )
        .await;
    let unknown_email = app
        .post(
            "/auth/login",
            json!({ "email": "nobody@example.com", "password": PASSWORD }),
        )
        .await;

    for response in [&wrong_password, &unknown_email] {
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.error_kind(), "invalid_credentials");
    }
    assert_eq!(wrong_password.body["message"], unknown_email.body["message"]);
}

#[tokio::test]
async fn test_login_rejects_invalid_email() {
    let app = TestApp::spawn().await;

    let response = app
        .post("/auth/login", json!({ "email": "not-an-email", "password": "x" }))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.error_kind(), "validation_error");
}

#[tokio::test]
async fn test_login_with_mfa_returns_challenge_only() {
    let app = TestApp::spawn().await;
    app.seed_user("bob@example.com");
    let (access, _) = app.login_tokens("bob@example.com").await;
    app.enable_mfa("bob@example.com", &access).await;

    let response = app.login("bob@example.com").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["requires_mfa"], true);
    assert!(response.body["temp_token"].as_str().is_some());
    assert!(response.body.get("access_token").is_none());
    assert!(response.body.get("refresh_token").is_none());

    // The pending token opens nothing.
    let temp = response.body["temp_token"].as_str().unwrap();
    let session = app.get("/auth/session", Some(temp)).await;
    assert_eq!(session.status, StatusCode::UNAUTHORIZED);
    assert_eq!(session.error_kind(), "mfa_required");
}

#[tokio::test]
async fn test_login_with_inline_totp_code() {
    let app = TestApp::spawn().await;
    app.seed_user("bob@example.com");
    let (access, _) = app.login_tokens("bob@example.com").await;
    let (secret, _) = app.enable_mfa("bob@example.com", &access).await;

    let response = app
        .post(
            "/auth/login",
            json!({
                "email": "bob@example.com",
                "password": PASSWORD,
                "mfa_code": totp_code(&secret, "bob@example.com"),
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let access = response.body["access_token"].as_str().unwrap();
    let session = app.get("/auth/session", Some(access)).await;
    assert_eq!(session.body["auth_method"], "mfa");
}
