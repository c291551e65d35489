use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static AUTH_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Security-relevant outcomes counted under `auth_events_total{event}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    LoginSuccess,
    LoginFailure,
    MfaChallenge,
    MfaFailure,
    Refresh,
    ReuseDetected,
    RateLimited,
    StoreFailOpen,
    OAuthLogin,
    PasswordReset,
    Registration,
}

impl AuthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEvent::LoginSuccess => "login_success",
            AuthEvent::LoginFailure => "login_failure",
            AuthEvent::MfaChallenge => "mfa_challenge",
            AuthEvent::MfaFailure => "mfa_failure",
            AuthEvent::Refresh => "refresh",
            AuthEvent::ReuseDetected => "reuse_detected",
            AuthEvent::RateLimited => "rate_limited",
            AuthEvent::StoreFailOpen => "store_fail_open",
            AuthEvent::OAuthLogin => "oauth_login",
            AuthEvent::PasswordReset => "password_reset",
            AuthEvent::Registration => "registration",
        }
    }
}

/// Count an auth event. A no-op until `init_metrics` has run, so library
/// users and tests need not set up a registry.
pub fn record(event: AuthEvent) {
    if let Some(counter) = AUTH_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event.as_str()]).inc();
    }
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let auth_events = IntCounterVec::new(
        Opts::new("auth_events_total", "Authentication and session security events"),
        &["event"],
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(auth_events.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = AUTH_EVENTS_TOTAL.set(auth_events);
    Ok(())
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_events_are_exported() {
        init_metrics().unwrap();
        record(AuthEvent::ReuseDetected);
        let text = get_metrics();
        assert!(text.contains("auth_events_total"));
        assert!(text.contains("event=\"reuse_detected\""));
    }
}
