//! OAuth login and account linking.
//!
//! Flow: `initiate` stores a single-use state under `oauth:state:{state}` and
//! returns the provider URL; `callback` consumes that state with `GETDEL`
//! before anything else, exchanges the code, and resolves the profile to a
//! local identity (existing link, then verified email, then a brand new
//! tenant + identity + link).

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use reqwest::{header, Client};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::crypto::TokenCipher;
use super::database::CredentialStore;
use super::error::ServiceError;
use super::jwt::AuthMethod;
use super::metrics::{self, AuthEvent};
use super::redis::CacheStore;
use super::session::{SessionManager, SessionTokens};
use crate::config::{OAuthConfig, OAuthProviderConfig};
use crate::models::{Identity, LinkedProvider, OAuthLink, Tenant};

const STATE_TTL_SECONDS: u64 = 600;
const STATE_BYTES: usize = 32;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const GITHUB_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";
const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

/// Tokens returned by a provider's code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The parts of a provider profile needed for account resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn authorization_url(&self, state: &str) -> Result<String, ServiceError>;

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ServiceError>;

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ServiceError>;
}

fn provider_error(context: &str, err: impl std::fmt::Display) -> ServiceError {
    ServiceError::OAuthProviderError(format!("{}: {}", context, err))
}

fn build_authorization_url(
    base: &str,
    config: &OAuthProviderConfig,
    scope: &str,
    state: &str,
) -> Result<String, ServiceError> {
    let query = serde_urlencoded::to_string([
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("response_type", "code"),
        ("scope", scope),
        ("state", state),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to encode authorization URL: {}", e))?;
    Ok(format!("{}?{}", base, query))
}

async fn exchange_authorization_code(
    client: &Client,
    token_url: &str,
    config: &OAuthProviderConfig,
    code: &str,
) -> Result<ProviderTokens, ServiceError> {
    let response = client
        .post(token_url)
        .header(header::ACCEPT, "application/json")
        .form(&[
            ("code", code),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret().as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .map_err(|e| provider_error("token exchange request failed", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(provider_error(
            "token exchange rejected",
            format!("{} {}", status, body),
        ));
    }

    response
        .json::<ProviderTokens>()
        .await
        .map_err(|e| provider_error("token response unreadable", e))
}

fn http_client() -> Result<Client, anyhow::Error> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(concat!("identity-service/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Google, via the OpenID userinfo endpoint.
pub struct GoogleProvider {
    client: Client,
    config: OAuthProviderConfig,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

impl GoogleProvider {
    pub fn new(config: OAuthProviderConfig) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn authorization_url(&self, state: &str) -> Result<String, ServiceError> {
        build_authorization_url(GOOGLE_AUTH_URL, &self.config, "openid email profile", state)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ServiceError> {
        exchange_authorization_code(&self.client, GOOGLE_TOKEN_URL, &self.config, code).await
    }

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ServiceError> {
        let info = self
            .client
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| provider_error("userinfo request failed", e))?
            .error_for_status()
            .map_err(|e| provider_error("userinfo rejected", e))?
            .json::<GoogleUserInfo>()
            .await
            .map_err(|e| provider_error("userinfo unreadable", e))?;

        Ok(ProviderProfile {
            provider_user_id: info.sub,
            email: info.email,
            email_verified: info.email_verified,
        })
    }
}

/// GitHub. The profile email may be private, so verified addresses come from
/// `/user/emails`.
pub struct GitHubProvider {
    client: Client,
    config: OAuthProviderConfig,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

impl GitHubProvider {
    pub fn new(config: OAuthProviderConfig) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<T, ServiceError> {
        self.client
            .get(url)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| provider_error("GitHub request failed", e))?
            .error_for_status()
            .map_err(|e| provider_error("GitHub rejected request", e))?
            .json::<T>()
            .await
            .map_err(|e| provider_error("GitHub response unreadable", e))
    }
}

#[async_trait]
impl OAuthProvider for GitHubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn authorization_url(&self, state: &str) -> Result<String, ServiceError> {
        build_authorization_url(GITHUB_AUTH_URL, &self.config, "read:user user:email", state)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ServiceError> {
        exchange_authorization_code(&self.client, GITHUB_TOKEN_URL, &self.config, code).await
    }

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ServiceError> {
        let user: GitHubUser = self.get_json(GITHUB_USER_URL, &tokens.access_token).await?;
        let emails: Vec<GitHubEmail> = self
            .get_json(GITHUB_EMAILS_URL, &tokens.access_token)
            .await?;

        let primary = emails.into_iter().find(|e| e.primary);
        Ok(ProviderProfile {
            provider_user_id: user.id.to_string(),
            email_verified: primary.as_ref().is_some_and(|e| e.verified),
            email: primary.map(|e| e.email),
        })
    }
}

/// Build every provider that has a client id configured.
pub fn configured_providers(
    config: &OAuthConfig,
) -> Result<Vec<Arc<dyn OAuthProvider>>, anyhow::Error> {
    let mut providers: Vec<Arc<dyn OAuthProvider>> = Vec::new();
    if let Some(google) = &config.google {
        providers.push(Arc::new(GoogleProvider::new(google.clone())?));
    }
    if let Some(github) = &config.github {
        providers.push(Arc::new(GitHubProvider::new(github.clone())?));
    }
    Ok(providers)
}

/// Test double: authorization codes map to canned profiles. Never
/// registered by `configured_providers`.
pub struct StubProvider {
    name: &'static str,
    profiles: Mutex<HashMap<String, ProviderProfile>>,
}

impl StubProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, code: &str, profile: ProviderProfile) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(code.to_string(), profile);
        }
    }
}

#[async_trait]
impl OAuthProvider for StubProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn authorization_url(&self, state: &str) -> Result<String, ServiceError> {
        Ok(format!("https://{}.test/authorize?state={}", self.name, state))
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ServiceError> {
        let known = self
            .profiles
            .lock()
            .map_err(|e| anyhow::anyhow!("Stub provider mutex poisoned: {}", e))?
            .contains_key(code);
        if !known {
            return Err(provider_error("token exchange rejected", "unknown code"));
        }
        Ok(ProviderTokens {
            access_token: code.to_string(),
            refresh_token: Some(format!("{}-refresh", code)),
        })
    }

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ServiceError> {
        self.profiles
            .lock()
            .map_err(|e| anyhow::anyhow!("Stub provider mutex poisoned: {}", e))?
            .get(&tokens.access_token)
            .cloned()
            .ok_or_else(|| provider_error("userinfo rejected", "unknown token"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    provider: String,
    redirect_uri: String,
}

fn state_key(state: &str) -> String {
    format!("oauth:state:{}", state)
}

/// A same-site path (`/x`, never `//x`) or a URL under an allowed origin.
pub fn is_allowed_redirect(target: &str, allowed_origins: &[String]) -> bool {
    if target.starts_with('/') {
        return !target.starts_with("//") && !target.contains('\\');
    }

    allowed_origins.iter().any(|origin| {
        let origin = origin.trim_end_matches('/');
        !origin.is_empty()
            && origin != "*"
            && (target == origin || target.starts_with(&format!("{}/", origin)))
    })
}

/// Result of a completed OAuth callback.
#[derive(Debug, Clone)]
pub struct OAuthLogin {
    pub identity: Identity,
    pub tokens: SessionTokens,
    pub redirect_uri: String,
    pub created: bool,
}

#[derive(Clone)]
pub struct OAuthLinker {
    providers: BTreeMap<&'static str, Arc<dyn OAuthProvider>>,
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn CredentialStore>,
    cipher: TokenCipher,
    sessions: SessionManager,
    allowed_origins: Vec<String>,
    default_redirect: String,
}

impl OAuthLinker {
    pub fn new(
        providers: Vec<Arc<dyn OAuthProvider>>,
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn CredentialStore>,
        cipher: TokenCipher,
        sessions: SessionManager,
        allowed_origins: Vec<String>,
        default_redirect: String,
    ) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name(), p)).collect(),
            cache,
            store,
            cipher,
            sessions,
            allowed_origins,
            default_redirect,
        }
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn OAuthProvider>, ServiceError> {
        self.providers
            .get(name)
            .ok_or_else(|| ServiceError::UnsupportedProvider(name.to_string()))
    }

    /// Store a fresh state and return the provider's authorization URL.
    #[tracing::instrument(skip(self))]
    pub async fn initiate(
        &self,
        provider: &str,
        redirect_uri: Option<&str>,
    ) -> Result<String, ServiceError> {
        let handler = self.provider(provider)?;

        let target = redirect_uri.unwrap_or(&self.default_redirect);
        if !is_allowed_redirect(target, &self.allowed_origins) {
            tracing::warn!(redirect_uri = %target, "Rejected OAuth redirect target");
            return Err(ServiceError::InvalidRedirect);
        }

        let mut bytes = [0u8; STATE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let state = URL_SAFE_NO_PAD.encode(bytes);

        let stored = serde_json::to_string(&StoredState {
            provider: provider.to_string(),
            redirect_uri: target.to_string(),
        })
        .map_err(|e| anyhow::anyhow!("Failed to serialize OAuth state: {}", e))?;

        self.cache
            .set_ex(&state_key(&state), &stored, STATE_TTL_SECONDS)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to store OAuth state");
                ServiceError::StoreUnavailable
            })?;

        handler.authorization_url(&state)
    }

    #[tracing::instrument(skip(self, state, code))]
    pub async fn callback(
        &self,
        provider: &str,
        state: &str,
        code: &str,
    ) -> Result<OAuthLogin, ServiceError> {
        let stored = self
            .cache
            .get_del(&state_key(state))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to read OAuth state");
                ServiceError::StoreUnavailable
            })?
            .ok_or(ServiceError::OAuthStateInvalid)?;
        let stored: StoredState =
            serde_json::from_str(&stored).map_err(|_| ServiceError::OAuthStateInvalid)?;
        if stored.provider != provider {
            tracing::warn!(expected = %stored.provider, "OAuth state used with another provider");
            return Err(ServiceError::OAuthStateInvalid);
        }

        let handler = self.provider(provider)?;
        let tokens = handler.exchange_code(code).await?;
        let profile = handler.fetch_profile(&tokens).await?;

        let email = match profile.email.as_deref() {
            Some(email) if profile.email_verified && !email.is_empty() => email.to_string(),
            _ => {
                return Err(ServiceError::OAuthProviderError(
                    "provider returned no verified email".to_string(),
                ))
            }
        };

        let access_enc = Some(self.cipher.encrypt(&tokens.access_token)?);
        let refresh_enc = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        let (identity, created) = self
            .resolve_identity(provider, &profile, &email, access_enc, refresh_enc)
            .await?;

        let tokens = self.sessions.issue_session(&identity, AuthMethod::OAuth).await?;
        metrics::record(AuthEvent::OAuthLogin);
        tracing::info!(user_id = %identity.user_id, provider, created, "OAuth login");

        Ok(OAuthLogin {
            identity,
            tokens,
            redirect_uri: stored.redirect_uri,
            created,
        })
    }

    async fn resolve_identity(
        &self,
        provider: &str,
        profile: &ProviderProfile,
        email: &str,
        access_enc: Option<String>,
        refresh_enc: Option<String>,
    ) -> Result<(Identity, bool), ServiceError> {
        let link = OAuthLink::new(
            Uuid::nil(),
            provider,
            &profile.provider_user_id,
            email,
            access_enc,
            refresh_enc,
        );

        if let Some(existing) = self
            .store
            .find_link(provider, &profile.provider_user_id)
            .await?
        {
            let identity = self.linked_identity(&existing).await?;
            self.store
                .upsert_link(&OAuthLink {
                    user_id: existing.user_id,
                    ..link
                })
                .await?;
            return Ok((identity, false));
        }

        if let Some(identity) = self.store.find_identity_by_email(email).await? {
            self.store
                .upsert_link(&OAuthLink {
                    user_id: identity.user_id,
                    ..link
                })
                .await?;
            tracing::info!(user_id = %identity.user_id, provider, "Linked provider to existing account");
            return Ok((identity, false));
        }

        let tenant = Tenant::personal(email);
        let identity = Identity::new_oauth(tenant.tenant_id, email.to_string());
        let link = OAuthLink {
            user_id: identity.user_id,
            ..link
        };

        match self.store.create_oauth_identity(&tenant, &identity, &link).await {
            Ok(()) => Ok((identity, true)),
            Err(e) => {
                // A concurrent callback for the same subject may have won.
                match self
                    .store
                    .find_link(provider, &profile.provider_user_id)
                    .await?
                {
                    Some(existing) => Ok((self.linked_identity(&existing).await?, false)),
                    None => Err(e),
                }
            }
        }
    }

    async fn linked_identity(&self, link: &OAuthLink) -> Result<Identity, ServiceError> {
        self.store
            .find_identity_by_id(link.user_id)
            .await?
            .ok_or(ServiceError::InvalidCredentials)
    }

    /// Configured providers and whether `user_id` has linked each.
    pub async fn providers(&self, user_id: Uuid) -> Result<Vec<LinkedProvider>, ServiceError> {
        let links = self.store.list_links(user_id).await?;
        Ok(self
            .providers
            .keys()
            .map(|name| {
                let link = links.iter().find(|l| l.provider == *name);
                LinkedProvider {
                    name: name.to_string(),
                    linked: link.is_some(),
                    email: link.map(|l| l.email.clone()),
                }
            })
            .collect())
    }

    /// Remove a link, refusing when it is the identity's only way in.
    #[tracing::instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn unlink(&self, identity: &Identity, provider: &str) -> Result<(), ServiceError> {
        let links = self.store.list_links(identity.user_id).await?;
        if !links.iter().any(|l| l.provider == provider) {
            return Ok(());
        }

        let others = links.iter().filter(|l| l.provider != provider).count();
        if !identity.has_password() && others == 0 {
            return Err(ServiceError::LastAuthMethod);
        }

        self.store.delete_link(identity.user_id, provider).await?;
        tracing::info!(provider, "Provider unlinked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn origins() -> Vec<String> {
        vec!["https://app.example.com".to_string()]
    }

    #[test]
    fn test_relative_redirects() {
        assert!(is_allowed_redirect("/", &origins()));
        assert!(is_allowed_redirect("/dashboard?tab=1", &origins()));
        assert!(!is_allowed_redirect("//evil.com/x", &origins()));
        assert!(!is_allowed_redirect("/\\evil.com", &origins()));
    }

    #[test]
    fn test_absolute_redirects_need_allowed_origin() {
        assert!(is_allowed_redirect("https://app.example.com", &origins()));
        assert!(is_allowed_redirect("https://app.example.com/home", &origins()));
        assert!(!is_allowed_redirect("https://app.example.com.evil.com/", &origins()));
        assert!(!is_allowed_redirect("https://evil.com/", &origins()));
        assert!(!is_allowed_redirect("javascript:alert(1)", &origins()));
        assert!(!is_allowed_redirect("https://x.com", &["*".to_string()]));
    }

    #[test]
    fn test_authorization_url_is_encoded() {
        let provider = GoogleProvider::new(OAuthProviderConfig {
            client_id: "client id".to_string(),
            client_secret: SecretString::new("secret".to_string()),
            redirect_uri: "https://id.example.com/oauth/google/callback".to_string(),
        })
        .unwrap();

        let url = provider.authorization_url("abc").unwrap();
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("client_id=client+id"));
        assert!(url.contains("state=abc"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fid.example.com%2Foauth%2Fgoogle%2Fcallback"));
        assert!(!url.contains("secret"));
    }

    #[tokio::test]
    async fn test_stub_rejects_unknown_code() {
        let stub = StubProvider::new("google");
        assert!(matches!(
            stub.exchange_code("nope").await,
            Err(ServiceError::OAuthProviderError(_))
        ));
    }
}
