//! Shared setup for identity-service integration tests.
//!
//! Builds the full router over the in-memory credential store, cache,
//! notifier and a stub Google provider, with RS256 keys from fixtures.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use identity_service::{
    build_router,
    config::{
        AuthConfig, DatabaseConfig, Environment, JwtConfig, MfaConfig, OAuthConfig, RateLimitConfig,
        RedisConfig, SecurityConfig, SmtpConfig, StoreFailurePolicy, DEFAULT_PUBLIC_PATHS,
    },
    models::Identity,
    services::{
        JwtService, MemoryCredentialStore, MockCache, MockNotifier, OAuthProvider,
        ProviderProfile, StubProvider,
    },
    utils::{hash_password, Password},
    AppState,
};
use secrecy::SecretString;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use totp_rs::{Algorithm, Secret, TOTP};
use tower::ServiceExt;
use uuid::Uuid;

const TEST_PRIVATE_KEY: &str = include_str!("../fixtures/signing_key.pem");
const TEST_PUBLIC_KEY: &str = include_str!("../fixtures/signing_key.pub.pem");

pub const TEST_ENCRYPTION_KEY: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const TOTP_ISSUER: &str = "Identity Test";
pub const PASSWORD: &str = "correct horse battery";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryCredentialStore>,
    pub cache: Arc<MockCache>,
    pub notifier: Arc<MockNotifier>,
    pub google: Arc<StubProvider>,
    _key_files: (NamedTempFile, NamedTempFile),
}

/// Decoded response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn error_kind(&self) -> &str {
        self.body["error"].as_str().unwrap_or_default()
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a tweaked configuration.
    pub async fn spawn_with(customize: impl FnOnce(&mut AuthConfig)) -> Self {
        let (private_file, public_file) = create_test_keys().expect("Failed to create test keys");
        let mut config = create_test_config(
            private_file.path().to_str().unwrap(),
            public_file.path().to_str().unwrap(),
        );
        customize(&mut config);

        let store = Arc::new(MemoryCredentialStore::new());
        let cache = Arc::new(MockCache::new());
        let notifier = Arc::new(MockNotifier::new());
        let google = Arc::new(StubProvider::new("google"));

        let jwt = JwtService::new(&config.jwt).expect("Failed to create JWT service");
        let state = AppState::assemble(
            config,
            jwt,
            store.clone(),
            cache.clone(),
            notifier.clone(),
            vec![google.clone() as Arc<dyn OAuthProvider>],
        )
        .expect("Failed to assemble state");

        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        TestApp {
            router,
            state,
            store,
            cache,
            notifier,
            google,
            _key_files: (private_file, public_file),
        }
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.send_request(request).await
    }

    /// Send a prebuilt request, for cases that need extra headers or
    /// extensions such as `ConnectInfo`.
    pub async fn send_request(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.send(Method::POST, uri, Some(body), None).await
    }

    pub async fn post_authed(&self, uri: &str, body: Value, bearer: &str) -> TestResponse {
        self.send(Method::POST, uri, Some(body), Some(bearer)).await
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        self.send(Method::GET, uri, None, bearer).await
    }

    /// Seed a password identity.
    pub fn seed_user(&self, email: &str) -> Identity {
        let hash = hash_password(&Password::new(PASSWORD.to_string()))
            .expect("Failed to hash password")
            .into_string();
        let identity = Identity::new_with_password(Uuid::new_v4(), email.to_string(), hash);
        self.store
            .insert_identity(identity.clone())
            .expect("Failed to seed identity");
        identity
    }

    pub async fn login(&self, email: &str) -> TestResponse {
        self.post(
            "/auth/login",
            serde_json::json!({ "email": email, "password": PASSWORD }),
        )
        .await
    }

    /// Log in (no MFA) and return `(access_token, refresh_token)`.
    pub async fn login_tokens(&self, email: &str) -> (String, String) {
        let response = self.login(email).await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);
        (
            response.body["access_token"].as_str().unwrap().to_string(),
            response.body["refresh_token"].as_str().unwrap().to_string(),
        )
    }

    /// Enroll and confirm TOTP for the caller. Returns the base32 secret and
    /// the backup codes.
    pub async fn enable_mfa(&self, email: &str, access_token: &str) -> (String, Vec<String>) {
        let enroll = self
            .post_authed("/auth/totp/enroll", serde_json::json!({}), access_token)
            .await;
        assert_eq!(enroll.status, StatusCode::OK, "enroll failed: {}", enroll.body);
        let secret = enroll.body["secret"].as_str().unwrap().to_string();

        let verify = self
            .post_authed(
                "/auth/totp/verify",
                serde_json::json!({ "code": totp_code(&secret, email) }),
                access_token,
            )
            .await;
        assert_eq!(verify.status, StatusCode::OK, "verify failed: {}", verify.body);
        let codes = verify.body["backup_codes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c.as_str().unwrap().to_string())
            .collect();

        (secret, codes)
    }

    /// Start an OAuth login and return the state from the authorization URL.
    pub async fn oauth_state(&self, provider: &str) -> String {
        let response = self
            .get(&format!("/oauth/{}/login", provider), None)
            .await;
        assert_eq!(response.status, StatusCode::SEE_OTHER);
        let location = response.headers[header::LOCATION].to_str().unwrap();
        location
            .split("state=")
            .nth(1)
            .expect("authorization URL without state")
            .to_string()
    }

    pub fn register_google(&self, code: &str, subject: &str, email: &str, verified: bool) {
        self.google.register(
            code,
            ProviderProfile {
                provider_user_id: subject.to_string(),
                email: Some(email.to_string()),
                email_verified: verified,
            },
        );
    }
}

/// Current TOTP code for a base32 secret.
pub fn totp_code(secret: &str, email: &str) -> String {
    let bytes = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        bytes,
        Some(TOTP_ISSUER.to_string()),
        email.to_string(),
    )
    .unwrap()
    .generate_current()
    .unwrap()
}

/// Write the fixture key pair to temporary PEM files.
pub fn create_test_keys() -> anyhow::Result<(NamedTempFile, NamedTempFile)> {
    let mut private_file = NamedTempFile::new()?;
    private_file.write_all(TEST_PRIVATE_KEY.as_bytes())?;

    let mut public_file = NamedTempFile::new()?;
    public_file.write_all(TEST_PUBLIC_KEY.as_bytes())?;

    Ok((private_file, public_file))
}

pub fn create_test_config(private_key_path: &str, public_key_path: &str) -> AuthConfig {
    AuthConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service-test".to_string(),
        service_version: "0.1.0".to_string(),
        log_level: "debug".to_string(),
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
            timeout_ms: 250,
        },
        store_failure_policy: StoreFailurePolicy::FailOpen,
        jwt: JwtConfig {
            private_key_path: private_key_path.to_string(),
            public_key_path: public_key_path.to_string(),
            key_id: "test-key-1".to_string(),
            issuer: "identity-service".to_string(),
            audience: "identity-api".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 30,
            mfa_token_expiry_minutes: 5,
            leeway_seconds: 30,
        },
        mfa: MfaConfig {
            issuer: TOTP_ISSUER.to_string(),
        },
        oauth: OAuthConfig {
            google: None,
            github: None,
            token_encryption_key: SecretString::new(TEST_ENCRYPTION_KEY.to_string()),
            default_redirect: "/".to_string(),
        },
        smtp: SmtpConfig {
            host: "localhost".to_string(),
            port: 25,
            user: String::new(),
            password: SecretString::new(String::new()),
            from: "no-reply@example.com".to_string(),
        },
        sms: None,
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            public_paths: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
            reset_url_base: "http://localhost:3000/reset-password".to_string(),
            secure_cookies: false,
            trusted_proxies: Vec::new(),
        },
        rate_limit: RateLimitConfig {
            anonymous_limit: 1000,
            authenticated_limit: 2000,
            window_seconds: 60,
            password_reset_attempts: 3,
            password_reset_window_seconds: 3600,
        },
    }
}
