//! Client configuration
//!
//! `ClientConfig` enumerates every construction parameter of the naming
//! client. It can be built in code with the `with_*` helpers, read from a
//! TOML file, and overridden from `SREGISTRY_*` environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use sregistry_api::{DEFAULT_CLUSTER, DEFAULT_CONTEXT_PATH, DEFAULT_GROUP};

use crate::error::{ClientError, Result};

pub const DEFAULT_HTTP_PORT: u16 = 8848;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

pub const ENV_SERVER_ADDR: &str = "SREGISTRY_SERVER_ADDR";
pub const ENV_NAMESPACE: &str = "SREGISTRY_NAMESPACE";
pub const ENV_ACCESS_KEY: &str = "SREGISTRY_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "SREGISTRY_SECRET_KEY";
pub const ENV_USERNAME: &str = "SREGISTRY_USERNAME";
pub const ENV_PASSWORD: &str = "SREGISTRY_PASSWORD";
pub const ENV_TLS_VERIFY: &str = "SREGISTRY_TLS_VERIFY";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => DEFAULT_HTTP_PORT,
            Scheme::Https => DEFAULT_HTTPS_PORT,
        }
    }
}

/// One registry server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Certificate verification; only meaningful for https
    pub tls_verify: bool,
}

impl Endpoint {
    /// Parse `[scheme://]host[:port]`.
    ///
    /// An https endpoint skips certificate verification unless `tls_verify`
    /// is explicitly `Some(true)`.
    pub fn parse(addr: &str, tls_verify: Option<bool>) -> Result<Self> {
        let addr = addr.trim().trim_end_matches('/');
        if addr.is_empty() {
            return Err(ClientError::InvalidConfig("empty server address".to_string()));
        }

        let (scheme, rest) = match addr.split_once("://") {
            Some((s, rest)) if s.eq_ignore_ascii_case("http") => (Scheme::Http, rest),
            Some((s, rest)) if s.eq_ignore_ascii_case("https") => (Scheme::Https, rest),
            Some((s, _)) => {
                return Err(ClientError::InvalidConfig(format!(
                    "unsupported scheme '{}' in server address '{}'",
                    s, addr
                )));
            }
            None => (Scheme::Http, addr),
        };

        if rest.contains('/') {
            return Err(ClientError::InvalidConfig(format!(
                "server address must not contain a path: '{}'",
                addr
            )));
        }

        let (host, port) = split_host_port(rest)
            .ok_or_else(|| ClientError::InvalidConfig(format!("malformed server address '{}'", addr)))?;
        let port = match port {
            Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| {
                ClientError::InvalidConfig(format!("invalid port in server address '{}'", addr))
            })?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            tls_verify: match scheme {
                Scheme::Http => true,
                Scheme::Https => tls_verify.unwrap_or(false),
            },
        })
    }

    /// Parse a comma-separated address list
    pub fn parse_list(addrs: &str, tls_verify: Option<bool>) -> Result<Vec<Self>> {
        addrs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Self::parse(s, tls_verify))
            .collect()
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `scheme://host:port` without trailing slash
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, None)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

fn split_host_port(s: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after {
            "" => Some((host, None)),
            _ => Some((host, Some(after.strip_prefix(':')?))),
        };
    }
    match s.matches(':').count() {
        0 if !s.is_empty() => Some((s, None)),
        1 => {
            let (host, port) = s.split_once(':')?;
            (!host.is_empty()).then_some((host, Some(port)))
        }
        _ => None,
    }
}

/// Configuration for the naming client
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server addresses, `[scheme://]host:port`
    #[serde(deserialize_with = "deserialize_addr_list")]
    pub server_addrs: Vec<String>,
    /// Namespace every operation is scoped to (empty = default namespace)
    pub namespace: String,
    /// Group services are registered under
    pub group_name: String,
    /// Cluster instances are registered into
    pub cluster_name: String,
    /// Context path (e.g., "/nacos")
    pub context_path: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Certificate verification for https endpoints; unset means disabled
    pub tls_verify: Option<bool>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Attempts per call across endpoints; unset means one pass over the list
    pub max_attempts: Option<usize>,
    /// Initial backoff between passes over the endpoint list
    pub retry_backoff_ms: u64,
    /// Backoff ceiling
    pub max_retry_backoff_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed beats before an instance is marked unhealthy
    pub max_missed_heartbeats: u32,
    /// How long the registry may hold a discovery long-poll
    pub long_poll_timeout_ms: u64,
    /// Hard TTL after which a cached snapshot must be refreshed before use
    pub cache_ttl_ms: u64,
    /// Directory for on-disk failover snapshots; unset disables them
    pub cache_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8848".to_string()],
            namespace: String::new(),
            group_name: DEFAULT_GROUP.to_string(),
            cluster_name: DEFAULT_CLUSTER.to_string(),
            context_path: DEFAULT_CONTEXT_PATH.to_string(),
            access_key: None,
            secret_key: None,
            username: None,
            password: None,
            tls_verify: None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
            max_attempts: None,
            retry_backoff_ms: 200,
            max_retry_backoff_ms: 5000,
            heartbeat_interval_ms: 5000,
            max_missed_heartbeats: 3,
            long_poll_timeout_ms: 30000,
            cache_ttl_ms: 90000,
            cache_dir: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addrs", &self.server_addrs)
            .field("namespace", &self.namespace)
            .field("group_name", &self.group_name)
            .field("cluster_name", &self.cluster_name)
            .field("context_path", &self.context_path)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls_verify", &self.tls_verify)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("long_poll_timeout_ms", &self.long_poll_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create a config from a comma-separated server address list
    pub fn new(server_addrs: &str) -> Self {
        Self {
            server_addrs: split_addrs(server_addrs),
            ..Default::default()
        }
    }

    /// Create a config with multiple server addresses
    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_group(mut self, group_name: &str) -> Self {
        self.group_name = group_name.to_string();
        self
    }

    /// Set access/secret key signing credentials
    pub fn with_access_key(mut self, access_key: &str, secret_key: &str) -> Self {
        self.access_key = Some(access_key.to_string());
        self.secret_key = Some(secret_key.to_string());
        self
    }

    /// Set username/password for token login
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = Some(verify);
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }

    /// Set context path
    pub fn with_context_path(mut self, path: &str) -> Self {
        self.context_path = path.to_string();
        self
    }

    pub fn with_retry(mut self, max_attempts: usize, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.max_attempts = Some(max_attempts);
        self.retry_backoff_ms = backoff_ms;
        self.max_retry_backoff_ms = max_backoff_ms;
        self
    }

    pub fn with_heartbeat(mut self, interval_ms: u64, max_missed: u32) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.max_missed_heartbeats = max_missed;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout_ms: u64) -> Self {
        self.long_poll_timeout_ms = timeout_ms;
        self
    }

    pub fn with_cache_ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ClientError::InvalidConfig(format!("failed to parse config: {}", e)))
    }

    /// Read a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `SREGISTRY_*` environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Override fields from `SREGISTRY_*` environment variables
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(addrs) = var(ENV_SERVER_ADDR) {
            self.server_addrs = split_addrs(&addrs);
        }
        if let Some(namespace) = var(ENV_NAMESPACE) {
            self.namespace = namespace;
        }
        if let Some(ak) = var(ENV_ACCESS_KEY) {
            self.access_key = Some(ak);
        }
        if let Some(sk) = var(ENV_SECRET_KEY) {
            self.secret_key = Some(sk);
        }
        if let Some(username) = var(ENV_USERNAME) {
            self.username = Some(username);
        }
        if let Some(password) = var(ENV_PASSWORD) {
            self.password = Some(password);
        }
        if let Some(verify) = var(ENV_TLS_VERIFY) {
            self.tls_verify = Some(matches!(
                verify.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ));
        }
        self
    }

    /// Parse and check the endpoint list
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let endpoints = self
            .server_addrs
            .iter()
            .flat_map(|s| split_addrs(s))
            .map(|s| Endpoint::parse(&s, self.tls_verify))
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one server address is required".to_string(),
            ));
        }
        Ok(endpoints)
    }

    /// Check everything that would make the client unusable
    pub fn validate(&self) -> Result<()> {
        self.endpoints()?;
        sregistry_api::validate_namespace_id(&self.namespace)
            .map_err(|e| ClientError::InvalidConfig(format!("namespace: {}", e.code)))?;
        sregistry_api::validate_group(&self.group_name)
            .map_err(|e| ClientError::InvalidConfig(format!("group: {}", e.code)))?;
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(ClientError::InvalidConfig(
                "access_key and secret_key must be set together".to_string(),
            ));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ClientError::InvalidConfig(
                "password is required when username is set".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ClientError::InvalidConfig(
                "max_missed_heartbeats must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn split_addrs(addrs: &str) -> Vec<String> {
    addrs
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_addr_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AddrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match AddrList::deserialize(deserializer)? {
        AddrList::One(s) => split_addrs(&s),
        AddrList::Many(list) => list.iter().flat_map(|s| split_addrs(s)).collect(),
    })
}
