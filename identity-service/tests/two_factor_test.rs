mod common;

use axum::http::StatusCode;
use common::{totp_code, TestApp};
use serde_json::json;

const EMAIL: &str = "bob@example.com";

/// Seed a user with MFA on. Returns the app, TOTP secret and backup codes.
async fn mfa_user() -> (TestApp, String, Vec<String>) {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;
    let (secret, codes) = app.enable_mfa(EMAIL, &access).await;
    (app, secret, codes)
}

async fn temp_token(app: &TestApp) -> String {
    let response = app.login(EMAIL).await;
    assert_eq!(response.body["requires_mfa"], true);
    response.body["temp_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_verify_with_totp_issues_pair() {
    let (app, secret, _) = mfa_user().await;
    let temp = temp_token(&app).await;

    let response = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["access_token"].as_str().is_some());
    assert!(response.body["refresh_token"].as_str().is_some());

    let session = app
        .get("/auth/session", response.body["access_token"].as_str())
        .await;
    assert_eq!(session.body["auth_method"], "mfa");
}

#[tokio::test]
async fn test_temp_token_is_single_use() {
    let (app, secret, _) = mfa_user().await;
    let temp = temp_token(&app).await;
    let body = json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) });

    let first = app.post("/auth/2fa/verify", body.clone()).await;
    assert_eq!(first.status, StatusCode::OK);

    let replay = app.post("/auth/2fa/verify", body).await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.error_kind(), "token_revoked");
}

#[tokio::test]
async fn test_replayed_temp_token_does_not_spend_a_backup_code() {
    let (app, _, codes) = mfa_user().await;
    let temp = temp_token(&app).await;

    let first = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[0] }),
        )
        .await;
    assert_eq!(first.status, StatusCode::OK);

    let replay = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[1] }),
        )
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.error_kind(), "token_revoked");

    let temp = temp_token(&app).await;
    let fresh = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[1] }),
        )
        .await;
    assert_eq!(fresh.status, StatusCode::OK);
}

#[tokio::test]
async fn test_held_temp_token_is_turned_away() {
    let (app, _, codes) = mfa_user().await;
    let temp = temp_token(&app).await;
    let jti = app.state.jwt.verify(&temp).unwrap().jti;

    // Another attempt with the same temp token is in flight.
    let hold = format!("mfa_attempt:{}", jti);
    assert!(app.state.revocation.acquire(&hold, 30).await.unwrap());

    let concurrent = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[0] }),
        )
        .await;
    assert_eq!(concurrent.status, StatusCode::UNAUTHORIZED);
    assert_eq!(concurrent.error_kind(), "token_revoked");

    app.state.revocation.release(&hold).await;
    let retry = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[0] }),
        )
        .await;
    assert_eq!(retry.status, StatusCode::OK);
}

#[tokio::test]
async fn test_wrong_code_releases_the_temp_token() {
    let (app, secret, _) = mfa_user().await;
    let temp = temp_token(&app).await;

    let wrong = app
        .post("/auth/2fa/verify", json!({ "temp_token": temp, "code": "000000" }))
        .await;
    assert_eq!(wrong.error_kind(), "mfa_invalid_code");

    let right = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    assert_eq!(right.status, StatusCode::OK);
}

#[tokio::test]
async fn test_backup_code_works_once() {
    let (app, _, codes) = mfa_user().await;
    assert_eq!(codes.len(), 10);

    let temp = temp_token(&app).await;
    let first = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[0] }),
        )
        .await;
    assert_eq!(first.status, StatusCode::OK);

    let temp = temp_token(&app).await;
    let second = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[0] }),
        )
        .await;
    assert_eq!(second.status, StatusCode::UNAUTHORIZED);
    assert_eq!(second.error_kind(), "mfa_invalid_code");

    // Input is normalised before hashing.
    let temp = temp_token(&app).await;
    let lowercase = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": codes[1].to_lowercase() }),
        )
        .await;
    assert_eq!(lowercase.status, StatusCode::OK);
}

#[tokio::test]
async fn test_out_of_band_code_completes_login() {
    let (app, _, _) = mfa_user().await;
    let temp = temp_token(&app).await;

    let sent = app
        .post(
            "/auth/2fa/otp",
            json!({ "temp_token": temp, "channel": "email" }),
        )
        .await;
    assert_eq!(sent.status, StatusCode::ACCEPTED);

    let code = app.notifier.last_to(EMAIL).expect("no code delivered");
    assert_eq!(code.len(), 6);

    let response = app
        .post("/auth/2fa/verify", json!({ "temp_token": temp, "code": code }))
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_sms_code_requires_phone() {
    let (app, _, _) = mfa_user().await;
    let temp = temp_token(&app).await;

    let response = app
        .post("/auth/2fa/otp", json!({ "temp_token": temp, "channel": "sms" }))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(app.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_failed_codes_lock_after_five() {
    let (app, secret, _) = mfa_user().await;
    let temp = temp_token(&app).await;

    for _ in 0..5 {
        let response = app
            .post("/auth/2fa/verify", json!({ "temp_token": temp, "code": "000000" }))
            .await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.error_kind(), "mfa_invalid_code");
    }

    // Even the right code is refused once the limit is reached.
    let response = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_enroll_twice_conflicts() {
    let (app, secret, _) = mfa_user().await;
    let temp = temp_token(&app).await;
    let tokens = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    let access = tokens.body["access_token"].as_str().unwrap();

    let response = app.post_authed("/auth/totp/enroll", json!({}), access).await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.error_kind(), "mfa_already_enabled");
}

#[tokio::test]
async fn test_enrollment_returns_recovery_key() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;

    let response = app.post_authed("/auth/totp/enroll", json!({}), &access).await;
    assert_eq!(response.status, StatusCode::OK);

    let secret = response.body["secret"].as_str().unwrap();
    let recovery = response.body["recovery_key"].as_str().unwrap();
    assert_eq!(recovery.replace(' ', ""), secret);
    assert!(response.body["otpauth_url"]
        .as_str()
        .unwrap()
        .starts_with("otpauth://totp/"));

    // Not enabled until confirmed.
    let login = app.login(EMAIL).await;
    assert!(login.body["access_token"].as_str().is_some());
}

#[tokio::test]
async fn test_verify_enrollment_without_pending_secret() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;

    let response = app
        .post_authed("/auth/totp/verify", json!({ "code": "123456" }), &access)
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_kind(), "mfa_not_enrolled");
}

#[tokio::test]
async fn test_disable_with_backup_code() {
    let (app, secret, codes) = mfa_user().await;
    let temp = temp_token(&app).await;
    let tokens = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    let access = tokens.body["access_token"].as_str().unwrap();

    let response = app
        .post_authed("/auth/totp/disable", json!({ "code": codes[3] }), access)
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let login = app.login(EMAIL).await;
    assert!(login.body["access_token"].as_str().is_some());
}

#[tokio::test]
async fn test_regenerate_replaces_backup_codes() {
    let (app, secret, old_codes) = mfa_user().await;
    let temp = temp_token(&app).await;
    let tokens = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": totp_code(&secret, EMAIL) }),
        )
        .await;
    let access = tokens.body["access_token"].as_str().unwrap();

    let response = app
        .post_authed(
            "/auth/totp/backup-codes",
            json!({ "code": totp_code(&secret, EMAIL) }),
            access,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let new_codes = response.body["backup_codes"].as_array().unwrap();
    assert_eq!(new_codes.len(), 10);

    let temp = temp_token(&app).await;
    let stale = app
        .post(
            "/auth/2fa/verify",
            json!({ "temp_token": temp, "code": old_codes[0] }),
        )
        .await;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_standalone_otp_request_and_verify() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;

    let sent = app
        .post_authed(
            "/auth/otp/request",
            json!({ "channel": "sms", "phone": "+15550100" }),
            &access,
        )
        .await;
    assert_eq!(sent.status, StatusCode::ACCEPTED);
    let code = app.notifier.last_to("+15550100").expect("no SMS captured");

    let verified = app
        .post_authed("/auth/otp/verify", json!({ "code": code }), &access)
        .await;
    assert_eq!(verified.status, StatusCode::OK);

    // Consumed on success.
    let again = app
        .post_authed("/auth/otp/verify", json!({ "code": code }), &access)
        .await;
    assert_eq!(again.status, StatusCode::UNAUTHORIZED);
    assert_eq!(again.error_kind(), "mfa_invalid_code");
}

#[tokio::test]
async fn test_otp_requests_limited_per_hour() {
    let app = TestApp::spawn().await;
    app.seed_user(EMAIL);
    let (access, _) = app.login_tokens(EMAIL).await;

    for _ in 0..3 {
        let response = app
            .post_authed("/auth/otp/request", json!({ "channel": "email" }), &access)
            .await;
        assert_eq!(response.status, StatusCode::ACCEPTED);
    }

    let fourth = app
        .post_authed("/auth/otp/request", json!({ "channel": "email" }), &access)
        .await;
    assert_eq!(fourth.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(app.notifier.sent().len(), 3);
}
