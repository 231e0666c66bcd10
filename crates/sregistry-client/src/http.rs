//! HTTP transport with request signing, retries, and failover
//!
//! Every registry call goes through [`RegistryHttpClient::send`]: the request
//! is signed by the configured credential provider, then tried against the
//! current endpoint and rotated through the remaining ones on connection
//! failures and 5xx answers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::CredentialProvider;
use crate::config::{ClientConfig, Endpoint};
use crate::error::{ClientError, Result};
use crate::metrics::{MetricsMonitor, Timer};

/// A registry call before it is bound to an endpoint
#[derive(Clone, Debug)]
pub struct RegistryRequest {
    pub method: Method,
    /// Path relative to the context path, e.g. `/v1/ns/instance`
    pub path: String,
    pub params: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Overrides the client read timeout (long-polls)
    pub timeout: Option<Duration>,
    /// Metrics label
    pub operation: &'static str,
}

impl RegistryRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            params: Vec::new(),
            form: Vec::new(),
            headers: Vec::new(),
            timeout: None,
            operation: "request",
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: &str) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn form_param(mut self, key: &str, value: impl ToString) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn operation(mut self, operation: &'static str) -> Self {
        self.operation = operation;
        self
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a registry answer
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn is_auth_rejected(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED || self.status == StatusCode::FORBIDDEN
    }

    /// Turn a non-2xx answer into `ServerError`
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::ServerError {
                code: self.status.as_u16(),
                message: self.body,
            })
        }
    }

    /// Parse the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            ClientError::Other(anyhow::anyhow!(
                "failed to decode response: {}, body: {}",
                e,
                self.body
            ))
        })
    }
}

/// HTTP client with authentication and failover support
pub struct RegistryHttpClient {
    client: Client,
    /// Used for https endpoints with certificate verification disabled
    insecure_client: Client,
    endpoints: Vec<Endpoint>,
    context_path: String,
    current_server_index: AtomicUsize,
    max_attempts: usize,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    credentials: CredentialProvider,
    metrics: Arc<MetricsMonitor>,
}

impl RegistryHttpClient {
    /// Create a new HTTP client. No request is sent until the first call.
    pub fn new(config: &ClientConfig, metrics: Arc<MetricsMonitor>) -> Result<Self> {
        let endpoints = config.endpoints()?;
        let credentials = CredentialProvider::from_config(config);
        Self::with_credentials(config, endpoints, credentials, metrics)
    }

    pub fn with_credentials(
        config: &ClientConfig,
        endpoints: Vec<Endpoint>,
        credentials: CredentialProvider,
        metrics: Arc<MetricsMonitor>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one server address is required".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()
            .map_err(|e| ClientError::Other(e.into()))?;

        let insecure: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|e| e.is_https() && !e.tls_verify)
            .collect();
        let insecure_client = if insecure.is_empty() {
            client.clone()
        } else {
            for endpoint in &insecure {
                warn!(
                    endpoint = %endpoint,
                    "TLS certificate verification is disabled; set tls_verify = true to enable it"
                );
            }
            Client::builder()
                .connect_timeout(config.connect_timeout())
                .timeout(config.read_timeout())
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| ClientError::Other(e.into()))?
        };

        let max_attempts = config.max_attempts.unwrap_or(endpoints.len()).max(1);

        Ok(Self {
            client,
            insecure_client,
            context_path: config.context_path.clone(),
            current_server_index: AtomicUsize::new(0),
            max_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(config.max_retry_backoff_ms),
            endpoints,
            credentials,
            metrics,
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The endpoint the next call starts with
    pub fn current_endpoint(&self) -> &Endpoint {
        let index = self.current_server_index.load(Ordering::Acquire);
        &self.endpoints[index % self.endpoints.len()]
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn metrics(&self) -> &Arc<MetricsMonitor> {
        &self.metrics
    }

    /// Switch away from a failed endpoint.
    ///
    /// Only advances if no concurrent call already moved the pointer.
    fn switch_to_next_server(&self, failed_index: usize) {
        if self.endpoints.len() < 2 {
            return;
        }
        let next = (failed_index + 1) % self.endpoints.len();
        if self
            .current_server_index
            .compare_exchange(failed_index, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.metrics.increment_endpoint_failover();
            debug!("Switched to server index: {}", next);
        }
    }

    /// Path as sent on the wire, context path included
    pub fn request_path(&self, path: &str) -> String {
        let context_path = self.context_path.trim_matches('/');

        if context_path.is_empty() {
            path.to_string()
        } else {
            format!("/{}{}", context_path, path)
        }
    }

    /// Build full URL with context path
    fn build_url(&self, endpoint: &Endpoint, path: &str) -> String {
        format!("{}{}", endpoint.base_url(), self.request_path(path))
    }

    fn backoff_for(&self, pass: u32) -> Duration {
        let factor = 2u32.saturating_pow(pass.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }

    /// Sign and send a request with failover.
    ///
    /// Returns the answer of the first endpoint that neither failed to
    /// connect nor returned 5xx; 4xx answers are returned as-is. A 401/403 is
    /// retried once with refreshed credentials.
    pub async fn send(&self, request: RegistryRequest) -> Result<TransportResponse> {
        let timer = Timer::start(&self.metrics, request.operation);
        let result = self.send_signed(request).await;
        match &result {
            Ok(resp) if resp.is_success() => timer.success(),
            Ok(resp) => timer.failure(resp.status.as_str()),
            Err(ClientError::RegistryUnreachable { .. }) => timer.failure("unreachable"),
            Err(ClientError::AuthExpired(_)) => timer.failure("auth_expired"),
            Err(_) => timer.failure("other"),
        }
        result
    }

    async fn send_signed(&self, request: RegistryRequest) -> Result<TransportResponse> {
        let mut signed = request.clone();
        self.credentials.sign(&mut signed, self).await?;
        let response = self.send_unsigned(&signed).await?;

        if !response.is_auth_rejected() || self.credentials.is_anonymous() {
            return Ok(response);
        }

        warn!(
            path = %request.path,
            status = %response.status,
            "Credentials rejected, refreshing and retrying once"
        );
        self.credentials.invalidate();

        let mut retry = request;
        self.credentials.sign(&mut retry, self).await?;
        let response = self.send_unsigned(&retry).await?;
        if response.is_auth_rejected() {
            return Err(ClientError::AuthExpired(format!(
                "request to {} rejected with status {}: {}",
                retry.path, response.status, response.body
            )));
        }
        Ok(response)
    }

    /// Failover loop without signing; used for login requests.
    pub(crate) async fn send_unsigned(&self, request: &RegistryRequest) -> Result<TransportResponse> {
        let server_count = self.endpoints.len();
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.max_attempts {
            if attempt > 0 && attempt % server_count == 0 {
                let backoff = self.backoff_for((attempt / server_count) as u32);
                debug!("All servers failed, backing off {:?} before next pass", backoff);
                tokio::time::sleep(backoff).await;
            }

            let index = self.current_server_index.load(Ordering::Acquire) % server_count;
            let endpoint = &self.endpoints[index];

            match self.attempt(endpoint, request).await {
                Ok(response) if response.status.is_server_error() => {
                    warn!(
                        endpoint = %endpoint,
                        status = %response.status,
                        "Server error, switching to next server"
                    );
                    last_error = format!("{} returned {}", endpoint, response.status);
                    self.switch_to_next_server(index);
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(endpoint = %endpoint, "Request failed: {}, switching to next server", e);
                    last_error = format!("{}: {}", endpoint, e);
                    self.switch_to_next_server(index);
                }
            }
        }

        Err(ClientError::RegistryUnreachable {
            attempts: self.max_attempts,
            message: last_error,
        })
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &RegistryRequest,
    ) -> std::result::Result<TransportResponse, reqwest::Error> {
        let url = self.build_url(endpoint, &request.path);
        let client = if endpoint.is_https() && !endpoint.tls_verify {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut builder = client.request(request.method.clone(), &url);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}
