use secrecy::SecretString;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub store_failure_policy: StoreFailurePolicy,
    pub jwt: JwtConfig,
    pub mfa: MfaConfig,
    pub oauth: OAuthConfig,
    pub smtp: SmtpConfig,
    pub sms: Option<SmsGatewayConfig>,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

/// What the core does when the cache cannot be reached on the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Log a warning and let the request through.
    FailOpen,
    /// Reject with a retryable 503.
    FailClosed,
}

impl StoreFailurePolicy {
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Dev => StoreFailurePolicy::FailOpen,
            Environment::Prod => StoreFailurePolicy::FailClosed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreFailurePolicy::FailOpen => "fail_open",
            StoreFailurePolicy::FailClosed => "fail_closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub key_id: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub mfa_token_expiry_minutes: i64,
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MfaConfig {
    pub issuer: String,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub google: Option<OAuthProviderConfig>,
    pub github: Option<OAuthProviderConfig>,
    /// 64 hex chars (32 bytes) used to encrypt provider tokens and TOTP seeds.
    pub token_encryption_key: SecretString,
    pub default_redirect: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub url: String,
    pub api_key: SecretString,
    pub sender_id: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub public_paths: Vec<String>,
    pub reset_url_base: String,
    pub secure_cookies: bool,
    /// Peers whose `x-forwarded-for` is believed. Empty means the socket
    /// address is always the client.
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub anonymous_limit: u64,
    pub authenticated_limit: u64,
    pub window_seconds: u64,
    pub password_reset_attempts: u64,
    pub password_reset_window_seconds: u64,
}

/// Paths reachable without a bearer token. Entries ending in `/*` match the
/// whole subtree.
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &[
    "/health",
    "/metrics",
    "/.well-known/jwks.json",
    "/.well-known/openapi.json",
    "/docs/*",
    "/auth/register",
    "/auth/login",
    "/auth/refresh",
    "/auth/logout",
    "/auth/2fa/verify",
    "/auth/2fa/otp",
    "/auth/password/reset/request",
    "/auth/password/reset/confirm",
    "/oauth/google/login",
    "/oauth/google/callback",
    "/oauth/github/login",
    "/oauth/github/callback",
];

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let store_failure_policy = match env::var("STORE_FAILURE_POLICY") {
            Ok(value) => value
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            Err(_) => StoreFailurePolicy::for_environment(environment),
        };

        let config = AuthConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
                timeout_ms: parse_env("REDIS_TIMEOUT_MS", "250")?,
            },
            store_failure_policy,
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                key_id: get_env("JWT_KEY_ID", Some("identity-rs256-1"), is_prod)?,
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                audience: get_env("JWT_AUDIENCE", Some("identity-api"), is_prod)?,
                access_token_expiry_minutes: parse_env("JWT_ACCESS_TOKEN_EXPIRY_MINUTES", "15")?,
                refresh_token_expiry_days: parse_env("JWT_REFRESH_TOKEN_EXPIRY_DAYS", "30")?,
                mfa_token_expiry_minutes: parse_env("JWT_MFA_TOKEN_EXPIRY_MINUTES", "5")?,
                leeway_seconds: parse_env("JWT_LEEWAY_SECONDS", "30")?,
            },
            mfa: MfaConfig {
                issuer: get_env("TOTP_ISSUER", Some("Identity"), is_prod)?,
            },
            oauth: OAuthConfig {
                google: provider_from_env("GOOGLE")?,
                github: provider_from_env("GITHUB")?,
                token_encryption_key: SecretString::new(get_env(
                    "TOKEN_ENCRYPTION_KEY",
                    None,
                    is_prod,
                )?),
                default_redirect: get_env("OAUTH_DEFAULT_REDIRECT", Some("/"), is_prod)?,
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                port: parse_env("SMTP_PORT", "587")?,
                user: get_env("SMTP_USER", Some(""), is_prod)?,
                password: SecretString::new(get_env("SMTP_PASSWORD", Some(""), is_prod)?),
                from: get_env("SMTP_FROM", Some("no-reply@localhost"), is_prod)?,
            },
            sms: match env::var("SMS_GATEWAY_URL") {
                Ok(url) if !url.is_empty() => Some(SmsGatewayConfig {
                    url,
                    api_key: SecretString::new(get_env("SMS_GATEWAY_API_KEY", None, is_prod)?),
                    sender_id: get_env("SMS_SENDER_ID", Some("IDENT"), is_prod)?,
                }),
                _ => None,
            },
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
                public_paths: match env::var("PUBLIC_PATHS") {
                    Ok(paths) => split_list(&paths),
                    Err(_) => DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
                },
                reset_url_base: get_env(
                    "RESET_URL_BASE",
                    Some("http://localhost:3000/reset-password"),
                    is_prod,
                )?,
                secure_cookies: is_prod
                    || get_env("SECURE_COOKIES", Some("true"), is_prod)?
                        .parse()
                        .unwrap_or(true),
                trusted_proxies: parse_ip_list(&env::var("TRUSTED_PROXIES").unwrap_or_default())?,
            },
            rate_limit: RateLimitConfig {
                anonymous_limit: parse_env("RATE_LIMIT_ANONYMOUS", "60")?,
                authenticated_limit: parse_env("RATE_LIMIT_AUTHENTICATED", "300")?,
                window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", "60")?,
                password_reset_attempts: parse_env("RATE_LIMIT_PASSWORD_RESET_ATTEMPTS", "3")?,
                password_reset_window_seconds: parse_env("RATE_LIMIT_PASSWORD_RESET_WINDOW_SECONDS", "3600")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.jwt.mfa_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_MFA_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.redis.timeout_ms == 0 || self.redis.timeout_ms >= 1000 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REDIS_TIMEOUT_MS must be between 1 and 999"
            )));
        }

        if self.rate_limit.authenticated_limit <= self.rate_limit.anonymous_limit {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_AUTHENTICATED must be higher than RATE_LIMIT_ANONYMOUS"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.store_failure_policy == StoreFailurePolicy::FailOpen {
                tracing::error!(
                    "STORE_FAILURE_POLICY=open in production: revocation checks will be skipped when the cache is down"
                );
            }
        }

        Ok(())
    }
}

fn provider_from_env(prefix: &str) -> Result<Option<OAuthProviderConfig>, AppError> {
    let client_id = match env::var(format!("{}_CLIENT_ID", prefix)) {
        Ok(id) if !id.is_empty() => id,
        _ => return Ok(None),
    };

    // Once a client id is present the rest of the provider block is mandatory.
    Ok(Some(OAuthProviderConfig {
        client_id,
        client_secret: SecretString::new(get_env(
            &format!("{}_CLIENT_SECRET", prefix),
            None,
            false,
        )?),
        redirect_uri: get_env(&format!("{}_REDIRECT_URI", prefix), None, false)?,
    }))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_ip_list(value: &str) -> Result<Vec<IpAddr>, AppError> {
    split_list(value)
        .iter()
        .map(|ip| {
            ip.parse::<IpAddr>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid TRUSTED_PROXIES entry '{}': {}", ip, e))
            })
        })
        .collect()
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    // Numeric tuning knobs keep their defaults in production too.
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
    })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(StoreFailurePolicy::FailOpen),
            "closed" => Ok(StoreFailurePolicy::FailClosed),
            _ => Err(format!("Invalid store failure policy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_follows_environment() {
        assert_eq!(
            StoreFailurePolicy::for_environment(Environment::Dev),
            StoreFailurePolicy::FailOpen
        );
        assert_eq!(
            StoreFailurePolicy::for_environment(Environment::Prod),
            StoreFailurePolicy::FailClosed
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "closed".parse::<StoreFailurePolicy>().unwrap(),
            StoreFailurePolicy::FailClosed
        );
        assert_eq!(
            "OPEN".parse::<StoreFailurePolicy>().unwrap(),
            StoreFailurePolicy::FailOpen
        );
        assert!("maybe".parse::<StoreFailurePolicy>().is_err());
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("Prod".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_trusted_proxies_parse() {
        let proxies = parse_ip_list("10.0.0.1, ::1").unwrap();
        assert_eq!(proxies.len(), 2);
        assert!(parse_ip_list("").unwrap().is_empty());
        assert!(parse_ip_list("10.0.0.0/8").is_err());
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(
            split_list(" /health, ,/auth/login "),
            vec!["/health".to_string(), "/auth/login".to_string()]
        );
    }
}
