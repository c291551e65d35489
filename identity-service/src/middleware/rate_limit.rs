use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use std::net::{IpAddr, SocketAddr};

use crate::services::Claims;
use crate::AppState;

const EXEMPT_PATHS: &[&str] = &["/health", "/metrics"];

/// The address a request is counted under. `x-forwarded-for` is only read
/// when the socket peer is a trusted proxy; the rightmost hop that is not
/// itself a trusted proxy is the client.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter_map(|hop| hop.parse::<IpAddr>().ok())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .find(|hop| !trusted.contains(hop))
        .unwrap_or(peer)
        .to_string()
}

/// Fixed-window limit per caller. Runs inside the auth layer so an
/// authenticated caller is counted by identity, with the higher ceiling.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if EXEMPT_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let limits = &state.config.rate_limit;
    let (key, limit) = match req.extensions().get::<Claims>() {
        Some(claims) => (
            format!("ratelimit:user:{}", claims.sub),
            limits.authenticated_limit,
        ),
        None => {
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0);
            (
                format!(
                    "ratelimit:ip:{}",
                    client_ip(req.headers(), peer, &state.config.security.trusted_proxies)
                ),
                limits.anonymous_limit,
            )
        }
    };

    state
        .revocation
        .check_and_increment(&key, limit, limits.window_seconds)
        .await?
        .into_result()?;

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let peer: SocketAddr = "198.51.100.9:4000".parse().unwrap();
        let headers = forwarded("203.0.113.7");
        assert_eq!(client_ip(&headers, Some(peer), &[]), "198.51.100.9");
    }

    #[test]
    fn test_forwarded_for_read_behind_trusted_proxy() {
        let proxy: IpAddr = "10.0.0.2".parse().unwrap();
        let peer = SocketAddr::new(proxy, 4000);
        // The client can prepend anything; only the hop the proxy appended counts.
        let headers = forwarded("1.1.1.1, 203.0.113.7");
        assert_eq!(client_ip(&headers, Some(peer), &[proxy]), "203.0.113.7");
    }

    #[test]
    fn test_skips_chained_trusted_proxies() {
        let edge: IpAddr = "10.0.0.1".parse().unwrap();
        let inner: IpAddr = "10.0.0.2".parse().unwrap();
        let peer = SocketAddr::new(inner, 4000);
        let headers = forwarded("203.0.113.7, 10.0.0.1");
        assert_eq!(client_ip(&headers, Some(peer), &[edge, inner]), "203.0.113.7");
    }

    #[test]
    fn test_falls_back_to_peer() {
        let proxy: IpAddr = "10.0.0.2".parse().unwrap();
        let peer = SocketAddr::new(proxy, 4000);
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer), &[proxy]), "10.0.0.2");
        assert_eq!(client_ip(&forwarded("garbage"), Some(peer), &[proxy]), "10.0.0.2");
        assert_eq!(client_ip(&HeaderMap::new(), None, &[]), "unknown");
    }
}
