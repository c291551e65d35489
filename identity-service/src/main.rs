use identity_service::{
    build_router,
    config::AuthConfig,
    db,
    services::{
        configured_providers, metrics, EmailService, JwtService, Notifier, PgCredentialStore,
        RedisService, SmsGateway,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to register metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        store_failure_policy = config.store_failure_policy.as_str(),
        "Starting identity service"
    );

    tracing::info!("Initializing database connections");
    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    tracing::info!("Database initialized successfully");

    let redis = RedisService::new(&config.redis).await?;
    tracing::info!("Redis service initialized");

    let email = EmailService::new(&config.smtp)?;
    let sms = config.sms.as_ref().map(SmsGateway::new).transpose()?;
    if sms.is_none() {
        tracing::warn!("SMS gateway not configured; SMS one-time codes are unavailable");
    }
    let notifier = Notifier::new(email, sms);
    tracing::info!("Notification channels initialized");

    let jwt = JwtService::new(&config.jwt)?;
    tracing::info!(kid = %config.jwt.key_id, "JWT service initialized");

    let providers = configured_providers(&config.oauth)?;
    tracing::info!(
        providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        "OAuth providers initialized"
    );

    let port = config.common.port;
    let service_name = config.service_name.clone();
    let service_version = config.service_version.clone();
    let environment = config.environment;

    let state = AppState::assemble(
        config,
        jwt,
        Arc::new(PgCredentialStore::new(pool)),
        Arc::new(redis),
        Arc::new(notifier),
        providers,
    )?;

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let service_span = tracing::info_span!(
        "service",
        service = %service_name,
        version = %service_version,
        environment = ?environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
