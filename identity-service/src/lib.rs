pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    security_headers::security_headers_middleware, tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{openapi::security::SecurityScheme, Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{AuthConfig, Environment};
use crate::services::{
    CacheStore, CredentialStore, JwtService, MfaEngine, NotificationSender, OAuthLinker,
    OAuthProvider, PasswordService, ResetLimits, RevocationStore, SessionManager, TokenCipher,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::jwks,
        handlers::auth::session::register,
        handlers::auth::session::login,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::auth::session::session,
        handlers::auth::two_factor::verify_login,
        handlers::auth::two_factor::send_login_code,
        handlers::auth::password::request_password_reset,
        handlers::auth::password::confirm_password_reset,
        handlers::auth::password::change_password,
        handlers::mfa::enroll_totp,
        handlers::mfa::verify_totp,
        handlers::mfa::disable_totp,
        handlers::mfa::regenerate_backup_codes,
        handlers::mfa::request_otp,
        handlers::mfa::verify_otp,
        handlers::oauth::oauth_login,
        handlers::oauth::oauth_callback,
        handlers::oauth::list_providers,
        handlers::oauth::unlink_provider,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::RegisterResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::TokenResponse,
            dtos::auth::MfaChallengeResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::MfaVerifyRequest,
            dtos::auth::LoginOtpRequest,
            dtos::auth::PasswordResetRequest,
            dtos::auth::PasswordResetConfirm,
            dtos::auth::PasswordChangeRequest,
            dtos::auth::MessageResponse,
            dtos::mfa::EnrollResponse,
            dtos::mfa::CodeRequest,
            dtos::mfa::BackupCodesResponse,
            dtos::mfa::OtpRequest,
            dtos::oauth::ProvidersResponse,
            models::LinkedProvider,
            models::OtpChannel,
            services::Claims,
            services::TokenKind,
            services::AuthMethod,
            services::Jwks,
            services::jwt::Jwk,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, MFA challenge, refresh rotation and passwords"),
        (name = "MFA", description = "TOTP enrollment, backup codes and one-time codes"),
        (name = "OAuth", description = "Provider login and account linking"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub jwt: Arc<JwtService>,
    pub store: Arc<dyn CredentialStore>,
    pub revocation: RevocationStore,
    pub sessions: SessionManager,
    pub mfa: MfaEngine,
    pub oauth: OAuthLinker,
    pub passwords: PasswordService,
}

impl AppState {
    /// Wire the engines over the given stores. Production passes Postgres,
    /// Redis and SMTP; tests pass the in-memory doubles.
    pub fn assemble(
        config: AuthConfig,
        jwt: JwtService,
        store: Arc<dyn CredentialStore>,
        cache: Arc<dyn CacheStore>,
        notifier: Arc<dyn NotificationSender>,
        providers: Vec<Arc<dyn OAuthProvider>>,
    ) -> Result<Self, anyhow::Error> {
        let jwt = Arc::new(jwt);
        let cipher = TokenCipher::from_hex(&config.oauth.token_encryption_key)?;

        let revocation = RevocationStore::new(
            cache.clone(),
            config.store_failure_policy,
            jwt.refresh_token_expiry_seconds().max(0) as u64,
        );

        let mfa = MfaEngine::new(
            store.clone(),
            cipher.clone(),
            revocation.clone(),
            notifier.clone(),
            config.mfa.issuer.clone(),
        );

        let sessions = SessionManager::new(jwt.clone(), revocation.clone(), store.clone(), mfa.clone());

        let oauth = OAuthLinker::new(
            providers,
            cache,
            store.clone(),
            cipher,
            sessions.clone(),
            config.security.allowed_origins.clone(),
            config.oauth.default_redirect.clone(),
        );

        let passwords = PasswordService::new(
            store.clone(),
            revocation.clone(),
            sessions.clone(),
            notifier,
            config.security.reset_url_base.clone(),
            ResetLimits {
                attempts: config.rate_limit.password_reset_attempts,
                window_seconds: config.rate_limit.password_reset_window_seconds,
            },
        );

        Ok(Self {
            config: Arc::new(config),
            jwt,
            store,
            revocation,
            sessions,
            mfa,
            oauth,
            passwords,
        })
    }
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, AppError> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            origin.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", origin, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks));

    // Swagger UI is a dev convenience; the raw document stays available.
    if state.config.environment == Environment::Dev {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    let app = app
        // Session lifecycle
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/session", get(handlers::auth::session))
        .route("/auth/2fa/verify", post(handlers::auth::verify_login))
        .route("/auth/2fa/otp", post(handlers::auth::send_login_code))
        // Passwords
        .route(
            "/auth/password/reset/request",
            post(handlers::auth::request_password_reset),
        )
        .route(
            "/auth/password/reset/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/auth/password/change", post(handlers::auth::change_password))
        // MFA management
        .route("/auth/totp/enroll", post(handlers::mfa::enroll_totp))
        .route("/auth/totp/verify", post(handlers::mfa::verify_totp))
        .route("/auth/totp/disable", post(handlers::mfa::disable_totp))
        .route(
            "/auth/totp/backup-codes",
            post(handlers::mfa::regenerate_backup_codes),
        )
        .route("/auth/otp/request", post(handlers::mfa::request_otp))
        .route("/auth/otp/verify", post(handlers::mfa::verify_otp))
        // OAuth
        .route("/oauth/providers", get(handlers::oauth::list_providers))
        .route("/oauth/:provider/login", get(handlers::oauth::oauth_login))
        .route(
            "/oauth/:provider/callback",
            get(handlers::oauth::oauth_callback),
        )
        .route("/oauth/:provider", delete(handlers::oauth::unlink_provider))
        // Route layers run only for matched routes, so MatchedPath is set for
        // metrics labels. Rate limiting sits inside auth to see the caller.
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .route_layer(from_fn(middleware::metrics_middleware))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins)?);

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A backing store is unreachable", body = ErrorResponse)
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        AppError::ServiceUnavailable(None)
    })?;

    state.revocation.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::ServiceUnavailable(None)
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "store_failure_policy": state.revocation.policy().as_str(),
        "checks": {
            "database": "up",
            "redis": "up"
        }
    })))
}
