//! Credential providers
//!
//! Adds authentication to outgoing registry requests: HMAC signatures for
//! access/secret key pairs and access tokens obtained by logging in with a
//! username and password. Tokens are cached and refreshed before expiry.

use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use sregistry_api::{
    ACCESS_KEY_HEADER, ACCESS_TOKEN, LOGIN_PATH, LoginResponse, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::http::{RegistryHttpClient, RegistryRequest};

type HmacSha256 = Hmac<Sha256>;

/// Token refresh buffer: refresh 5 minutes before expiry
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// Upper bound on how long a token is trusted, whatever TTL was granted
const MAX_TOKEN_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Signs requests with an access key / secret key pair
#[derive(Clone)]
pub struct StaticKeyProvider {
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl StaticKeyProvider {
    pub fn new(access_key: &str, secret_key: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// `METHOD\npath\nk=v&k=v\ntimestamp` with parameters sorted by key.
    ///
    /// Query and form parameters are both covered; the access token is not.
    pub fn canonical_string(request: &RegistryRequest, path: &str, timestamp: i64) -> String {
        let mut params: Vec<(&str, &str)> = request
            .params
            .iter()
            .chain(request.form.iter())
            .filter(|(k, _)| k != ACCESS_TOKEN)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        params.sort();

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        format!(
            "{}\n{}\n{}\n{}",
            request.method.as_str(),
            path,
            query,
            timestamp
        )
    }

    /// Base64 HMAC-SHA256 of `content` keyed by the secret key
    pub fn signature(&self, content: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ClientError::Other(anyhow::anyhow!("invalid signing key: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Attach signature headers, `path` being the full request path
    pub fn sign_at(&self, request: &mut RegistryRequest, path: &str, timestamp: i64) -> Result<()> {
        let content = Self::canonical_string(request, path, timestamp);
        let signature = self.signature(&content)?;
        request
            .headers
            .retain(|(k, _)| k != ACCESS_KEY_HEADER && k != TIMESTAMP_HEADER && k != SIGNATURE_HEADER);
        request
            .headers
            .push((ACCESS_KEY_HEADER.to_string(), self.access_key.clone()));
        request
            .headers
            .push((TIMESTAMP_HEADER.to_string(), timestamp.to_string()));
        request
            .headers
            .push((SIGNATURE_HEADER.to_string(), signature));
        Ok(())
    }

    pub fn sign(&self, request: &mut RegistryRequest, path: &str) -> Result<()> {
        self.sign_at(request, path, chrono::Utc::now().timestamp_millis())
    }
}

/// Cached token info
#[derive(Clone, Debug)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

impl TokenInfo {
    fn new(access_token: String, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            access_token,
            expires_at: now.checked_add(ttl.min(MAX_TOKEN_TTL)).unwrap_or(now),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now + Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS)
    }

    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Obtains access tokens via username/password login and caches them
pub struct TokenProvider {
    username: Option<String>,
    password: String,
    token: RwLock<Option<TokenInfo>>,
    /// Serializes logins so concurrent callers share one refresh
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: password.to_string(),
            token: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A provider seeded with a pre-issued token; it can never log in
    pub fn with_token(access_token: &str, ttl: Duration) -> Self {
        Self {
            username: None,
            password: String::new(),
            token: RwLock::new(Some(TokenInfo::new(access_token.to_string(), ttl))),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn can_login(&self) -> bool {
        self.username.is_some()
    }

    fn fresh_token(&self) -> Option<String> {
        let now = Instant::now();
        self.token
            .read()
            .as_ref()
            .filter(|info| info.is_fresh(now))
            .map(|info| info.access_token.clone())
    }

    fn valid_token(&self) -> Option<String> {
        let now = Instant::now();
        self.token
            .read()
            .as_ref()
            .filter(|info| info.is_valid(now))
            .map(|info| info.access_token.clone())
    }

    /// Get a valid access token, refreshing if needed.
    ///
    /// A failed refresh falls back to the cached token while it is still
    /// unexpired. Without one, an unreachable registry is reported as such
    /// and any other login failure as `AuthExpired`.
    pub async fn access_token(&self, transport: &RegistryHttpClient) -> Result<String> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let Some(username) = self.username.as_deref() else {
            return self.valid_token().ok_or_else(|| {
                ClientError::AuthExpired("pre-issued access token has expired".to_string())
            });
        };

        match self.login(username, transport).await {
            Ok(token) => Ok(token),
            Err(e) => match self.valid_token() {
                Some(token) => {
                    warn!("Token refresh failed, using cached token: {}", e);
                    Ok(token)
                }
                None if e.is_unreachable() => Err(e),
                None => Err(ClientError::AuthExpired(format!("login failed: {}", e))),
            },
        }
    }

    /// Drop the cached token so the next request logs in again
    pub fn invalidate(&self) {
        if self.can_login() {
            *self.token.write() = None;
        }
    }

    async fn login(&self, username: &str, transport: &RegistryHttpClient) -> Result<String> {
        debug!(username = %username, "Logging in to registry");

        let request = RegistryRequest::post(LOGIN_PATH)
            .form_param("username", username)
            .form_param("password", &self.password)
            .operation("login");
        let response = transport.send_unsigned(&request).await?.error_for_status()?;
        let login: LoginResponse = response.json()?;

        let ttl = login.ttl_secs().max(0) as u64;
        *self.token.write() = Some(TokenInfo::new(
            login.access_token.clone(),
            Duration::from_secs(ttl),
        ));

        debug!("Authentication successful, token expires in {} seconds", ttl);
        Ok(login.access_token)
    }
}

/// How requests are authenticated
#[derive(Debug, Default)]
pub enum CredentialProvider {
    #[default]
    Anonymous,
    StaticKey(StaticKeyProvider),
    Token(TokenProvider),
    KeyAndToken(StaticKeyProvider, TokenProvider),
}

impl CredentialProvider {
    pub fn from_config(config: &ClientConfig) -> Self {
        let key = match (&config.access_key, &config.secret_key) {
            (Some(ak), Some(sk)) if !ak.is_empty() => Some(StaticKeyProvider::new(ak, sk)),
            _ => None,
        };
        let token = match (&config.username, &config.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some(TokenProvider::new(user, pass)),
            _ => None,
        };

        match (key, token) {
            (Some(key), Some(token)) => CredentialProvider::KeyAndToken(key, token),
            (Some(key), None) => CredentialProvider::StaticKey(key),
            (None, Some(token)) => CredentialProvider::Token(token),
            (None, None) => CredentialProvider::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, CredentialProvider::Anonymous)
    }

    fn token_provider(&self) -> Option<&TokenProvider> {
        match self {
            CredentialProvider::Token(token) | CredentialProvider::KeyAndToken(_, token) => {
                Some(token)
            }
            _ => None,
        }
    }

    fn key_provider(&self) -> Option<&StaticKeyProvider> {
        match self {
            CredentialProvider::StaticKey(key) | CredentialProvider::KeyAndToken(key, _) => {
                Some(key)
            }
            _ => None,
        }
    }

    /// Add authentication to `request`
    pub async fn sign(
        &self,
        request: &mut RegistryRequest,
        transport: &RegistryHttpClient,
    ) -> Result<()> {
        if let Some(token) = self.token_provider() {
            let access_token = token.access_token(transport).await?;
            request.params.retain(|(k, _)| k != ACCESS_TOKEN);
            request.params.push((ACCESS_TOKEN.to_string(), access_token));
        }
        if let Some(key) = self.key_provider() {
            key.sign(request, &transport.request_path(&request.path))?;
        }
        Ok(())
    }

    /// Forget cached credentials after the server rejected them
    pub fn invalidate(&self) {
        if let Some(token) = self.token_provider() {
            token.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::MetricsMonitor;

    fn offline_transport(credentials: CredentialProvider) -> RegistryHttpClient {
        let config = ClientConfig::new("http://127.0.0.1:1")
            .with_timeouts(100, 100)
            .with_retry(1, 1, 1);
        let endpoints = config.endpoints().unwrap();
        RegistryHttpClient::with_credentials(
            &config,
            endpoints,
            credentials,
            Arc::new(MetricsMonitor::new().unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_string_sorts_and_skips_token() {
        let request = RegistryRequest::post("/v1/ns/instance")
            .param("serviceName", "svc")
            .param("ip", "10.0.0.1")
            .param(ACCESS_TOKEN, "tok")
            .form_param("port", 8080);
        let content = StaticKeyProvider::canonical_string(&request, "/nacos/v1/ns/instance", 42);
        assert_eq!(
            content,
            "POST\n/nacos/v1/ns/instance\nip=10.0.0.1&port=8080&serviceName=svc\n42"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let provider = StaticKeyProvider::new("ak", "sk");
        let a = provider.signature("content").unwrap();
        let b = provider.signature("content").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, provider.signature("other").unwrap());
        // 32 byte digest in base64
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_sign_at_replaces_headers() {
        let provider = StaticKeyProvider::new("ak", "sk");
        let mut request = RegistryRequest::get("/v1/ns/instance/list").param("serviceName", "svc");
        provider.sign_at(&mut request, "/nacos/v1/ns/instance/list", 1).unwrap();
        provider.sign_at(&mut request, "/nacos/v1/ns/instance/list", 2).unwrap();

        assert_eq!(request.headers.len(), 3);
        let ts = request
            .headers
            .iter()
            .find(|(k, _)| k == TIMESTAMP_HEADER)
            .map(|(_, v)| v.as_str());
        assert_eq!(ts, Some("2"));
    }

    #[test]
    fn test_from_config_variants() {
        let config = ClientConfig::default();
        assert!(CredentialProvider::from_config(&config).is_anonymous());

        let config = ClientConfig::default().with_access_key("ak", "sk");
        assert!(matches!(
            CredentialProvider::from_config(&config),
            CredentialProvider::StaticKey(_)
        ));

        let config = ClientConfig::default().with_auth("nacos", "nacos");
        assert!(matches!(
            CredentialProvider::from_config(&config),
            CredentialProvider::Token(_)
        ));

        let config = ClientConfig::default()
            .with_access_key("ak", "sk")
            .with_auth("nacos", "nacos");
        assert!(matches!(
            CredentialProvider::from_config(&config),
            CredentialProvider::KeyAndToken(_, _)
        ));
    }

    #[tokio::test]
    async fn test_seeded_token_is_used_without_login() {
        let credentials = CredentialProvider::Token(TokenProvider::with_token(
            "seeded",
            Duration::from_secs(3600),
        ));
        let transport = offline_transport(CredentialProvider::Anonymous);

        let mut request = RegistryRequest::get("/v1/ns/instance/list");
        credentials.sign(&mut request, &transport).await.unwrap();
        assert_eq!(request.param_value(ACCESS_TOKEN), Some("seeded"));
    }

    #[tokio::test]
    async fn test_near_expiry_token_survives_failed_refresh() {
        // Inside the refresh buffer but not yet expired; login is impossible
        // because nothing listens on the endpoint
        let provider = TokenProvider::new("nacos", "nacos");
        *provider.token.write() = Some(TokenInfo {
            access_token: "cached".to_string(),
            expires_at: Instant::now() + Duration::from_secs(60),
        });
        let transport = offline_transport(CredentialProvider::Anonymous);

        let token = provider.access_token(&transport).await.unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn test_expired_seeded_token_fails() {
        let provider = TokenProvider::with_token("old", Duration::ZERO);
        let transport = offline_transport(CredentialProvider::Anonymous);

        let err = provider.access_token(&transport).await.unwrap_err();
        assert!(matches!(err, ClientError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_failed_login_without_cache_reports_unreachable() {
        let provider = TokenProvider::new("nacos", "nacos");
        let transport = offline_transport(CredentialProvider::Anonymous);

        let err = provider.access_token(&transport).await.unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {:?}", err);
        assert!(!matches!(err, ClientError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_unbounded_ttl_is_clamped() {
        let provider = TokenProvider::with_token("forever", Duration::MAX);
        let transport = offline_transport(CredentialProvider::Anonymous);

        assert_eq!(provider.access_token(&transport).await.unwrap(), "forever");
        let expires_at = provider.token.read().as_ref().unwrap().expires_at;
        assert!(expires_at <= Instant::now() + MAX_TOKEN_TTL);
    }
}
