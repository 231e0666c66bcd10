//! In-memory Nacos-compatible registry for integration tests
//!
//! Serves the v1 naming endpoints the client uses from shared state behind a
//! wiremock server. Instance lists keep registration order and every
//! mutation bumps the service checksum.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sregistry_api::naming::{BeatInfo, HealthStatus, Instance, ServiceInfo, grouped_name};
use sregistry_api::{DEFAULT_GROUP, SERVICE_INFO_SPLITER};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Beat behaviour of the fake registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeatMode {
    Ack,
    /// Answer 500 to every beat
    Fail,
    /// Acknowledge with a plain `ok` body, as older registries do
    PlainOk,
}

#[derive(Default)]
struct Service {
    instances: Vec<Instance>,
    revision: u64,
}

pub struct State {
    services: HashMap<String, Service>,
    beat_mode: BeatMode,
    unavailable: bool,
    cache_millis: u64,
    credentials: Option<(String, String)>,
    token_ttl: i64,
    valid_tokens: Vec<String>,
    issued_tokens: usize,
    beats: HashMap<String, usize>,
    requests: Vec<(String, String)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            beat_mode: BeatMode::Ack,
            unavailable: false,
            cache_millis: 10000,
            credentials: None,
            token_ttl: 18000,
            valid_tokens: Vec::new(),
            issued_tokens: 0,
            beats: HashMap::new(),
            requests: Vec::new(),
        }
    }
}

pub struct FakeRegistry {
    pub server: MockServer,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        Self::start_with_state(State::default()).await
    }

    /// Every call except login requires a token issued for these credentials
    pub async fn start_with_auth(username: &str, password: &str) -> Self {
        Self::start_with_state(State {
            credentials: Some((username.to_string(), password.to_string())),
            ..Default::default()
        })
        .await
    }

    async fn start_with_state(state: State) -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(state));
        Mock::given(any())
            .respond_with(NacosResponder {
                state: state.clone(),
            })
            .mount(&server)
            .await;
        Self { server, state }
    }

    /// `http://127.0.0.1:<port>`
    pub fn addr(&self) -> String {
        self.server.uri()
    }

    pub fn instances(&self, service: &str) -> Vec<Instance> {
        self.state
            .lock()
            .services
            .get(&grouped_name(DEFAULT_GROUP, service))
            .map(|s| s.instances.clone())
            .unwrap_or_default()
    }

    /// Register an instance as if another client had done it
    pub fn add_instance(&self, service: &str, instance: Instance) {
        self.state
            .lock()
            .upsert(&grouped_name(DEFAULT_GROUP, service), instance);
    }

    /// Drop an instance as if the registry had expired it
    pub fn remove_instance(&self, service: &str, ip: &str, port: u16) {
        self.state
            .lock()
            .remove(&grouped_name(DEFAULT_GROUP, service), ip, port);
    }

    pub fn set_beat_mode(&self, mode: BeatMode) {
        self.state.lock().beat_mode = mode;
    }

    /// Answer 503 to everything
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn set_cache_millis(&self, cache_millis: u64) {
        self.state.lock().cache_millis = cache_millis;
    }

    /// TTL in seconds granted by later logins
    pub fn set_token_ttl(&self, ttl: i64) {
        self.state.lock().token_ttl = ttl;
    }

    /// Invalidate every issued token, as after a server-side expiry
    pub fn revoke_tokens(&self) {
        self.state.lock().valid_tokens.clear();
    }

    pub fn issued_tokens(&self) -> usize {
        self.state.lock().issued_tokens
    }

    pub fn beat_count(&self, ip: &str, port: u16) -> usize {
        self.state
            .lock()
            .beats
            .get(&format!("{}:{}", ip, port))
            .copied()
            .unwrap_or(0)
    }

    /// Number of requests with this method and path (context path included)
    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, p)| m == method && p == path)
            .count()
    }
}

impl State {
    fn upsert(&mut self, key: &str, instance: Instance) {
        let service = self.services.entry(key.to_string()).or_default();
        match service
            .instances
            .iter()
            .position(|i| i.same_address(&instance.ip, instance.port))
        {
            Some(index) => service.instances[index] = instance,
            None => service.instances.push(instance),
        }
        service.revision += 1;
    }

    fn remove(&mut self, key: &str, ip: &str, port: u16) -> bool {
        let Some(service) = self.services.get_mut(key) else {
            return false;
        };
        let before = service.instances.len();
        service.instances.retain(|i| !i.same_address(ip, port));
        let removed = service.instances.len() != before;
        if removed {
            service.revision += 1;
        }
        removed
    }

    fn contains(&self, key: &str, ip: &str, port: u16) -> bool {
        self.services
            .get(key)
            .map(|s| s.instances.iter().any(|i| i.same_address(ip, port)))
            .unwrap_or(false)
    }
}

struct NacosResponder {
    state: Arc<Mutex<State>>,
}

fn params(request: &Request) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = request
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if let Ok(form) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&request.body) {
        params.extend(form);
    }
    params
}

fn service_key(params: &HashMap<String, String>) -> String {
    let name = params.get("serviceName").cloned().unwrap_or_default();
    if name.contains(SERVICE_INFO_SPLITER) {
        name
    } else {
        let group = params
            .get("groupName")
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        grouped_name(&group, &name)
    }
}

fn instance_from_params(params: &HashMap<String, String>) -> Option<Instance> {
    let ip = params.get("ip")?.clone();
    let port = params.get("port")?.parse().ok()?;
    let mut instance = Instance::new(ip, port);
    if let Some(weight) = params.get("weight").and_then(|w| w.parse().ok()) {
        instance.weight = weight;
    }
    if let Some(metadata) = params
        .get("metadata")
        .and_then(|m| serde_json::from_str(m).ok())
    {
        instance.metadata = metadata;
    }
    if let Some(enabled) = params.get("enabled").and_then(|e| e.parse().ok()) {
        instance.enabled = enabled;
    }
    if let Some(ephemeral) = params.get("ephemeral").and_then(|e| e.parse().ok()) {
        instance.ephemeral = ephemeral;
    }
    if let Some(cluster) = params.get("clusterName") {
        instance.cluster_name = cluster.clone();
    }
    instance.health = HealthStatus::Healthy;
    instance.service_name = service_key(params);
    Some(instance)
}

impl Respond for NacosResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let method = request.method.as_str().to_string();
        let path = request.url.path().to_string();
        state.requests.push((method.clone(), path.clone()));

        if state.unavailable {
            return ResponseTemplate::new(503).set_body_string("service unavailable");
        }

        let params = params(request);
        let route = path.strip_prefix("/nacos").unwrap_or(&path).to_string();

        if method == "POST" && route == "/v1/auth/login" {
            return match &state.credentials {
                Some((user, pass))
                    if params.get("username") == Some(user)
                        && params.get("password") == Some(pass) =>
                {
                    state.issued_tokens += 1;
                    let token = format!("token-{}", state.issued_tokens);
                    state.valid_tokens.push(token.clone());
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "accessToken": token,
                        "tokenTtl": state.token_ttl,
                        "globalAdmin": false
                    }))
                }
                _ => ResponseTemplate::new(403).set_body_string("unknown user!"),
            };
        }

        if state.credentials.is_some() {
            let authorized = params
                .get("accessToken")
                .map(|t| state.valid_tokens.contains(t))
                .unwrap_or(false);
            if !authorized {
                return ResponseTemplate::new(403).set_body_string("token invalid!");
            }
        }

        let key = service_key(&params);
        match (method.as_str(), route.as_str()) {
            ("POST", "/v1/ns/instance") => match instance_from_params(&params) {
                Some(instance) => {
                    state.upsert(&key, instance);
                    ResponseTemplate::new(200).set_body_string("ok")
                }
                None => ResponseTemplate::new(400).set_body_string("missing ip or port"),
            },
            ("PUT", "/v1/ns/instance") => match instance_from_params(&params) {
                Some(instance) if state.contains(&key, &instance.ip, instance.port) => {
                    state.upsert(&key, instance);
                    ResponseTemplate::new(200).set_body_string("ok")
                }
                _ => ResponseTemplate::new(400).set_body_string("instance not exist"),
            },
            ("DELETE", "/v1/ns/instance") => {
                let ip = params.get("ip").cloned().unwrap_or_default();
                let port = params
                    .get("port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                state.remove(&key, &ip, port);
                ResponseTemplate::new(200).set_body_string("ok")
            }
            ("PUT", "/v1/ns/instance/beat") => {
                if state.beat_mode == BeatMode::Fail {
                    return ResponseTemplate::new(500).set_body_string("beat failed");
                }
                if state.beat_mode == BeatMode::PlainOk {
                    return ResponseTemplate::new(200).set_body_string("ok");
                }
                let Some(beat) = params
                    .get("beat")
                    .and_then(|b| serde_json::from_str::<BeatInfo>(b).ok())
                else {
                    return ResponseTemplate::new(400).set_body_string("missing beat");
                };
                *state
                    .beats
                    .entry(format!("{}:{}", beat.ip, beat.port))
                    .or_default() += 1;
                let code = if state.contains(&key, &beat.ip, beat.port) {
                    10200
                } else {
                    20404
                };
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "clientBeatInterval": 5000,
                    "code": code,
                    "lightBeatEnabled": true
                }))
            }
            ("GET", "/v1/ns/instance") => {
                let ip = params.get("ip").cloned().unwrap_or_default();
                let port: u16 = params
                    .get("port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                let healthy_only = params.get("healthyOnly").map(String::as_str) == Some("true");
                let found = state.services.get(&key).and_then(|s| {
                    s.instances
                        .iter()
                        .find(|i| i.same_address(&ip, port) && (!healthy_only || i.is_healthy()))
                        .cloned()
                });
                match found {
                    Some(instance) => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "service": key,
                        "ip": instance.ip,
                        "port": instance.port,
                        "clusterName": instance.cluster_name,
                        "weight": instance.weight,
                        "healthy": instance.is_healthy(),
                        "instanceId": instance.instance_id,
                        "metadata": instance.metadata
                    })),
                    None => ResponseTemplate::new(404)
                        .set_body_string(format!("no ips found for cluster in service {}", key)),
                }
            }
            ("GET", "/v1/ns/instance/list") => {
                let (hosts, revision) = state
                    .services
                    .get(&key)
                    .map(|s| (s.instances.clone(), s.revision))
                    .unwrap_or_default();
                let info = ServiceInfo {
                    name: key.clone(),
                    group_name: params.get("groupName").cloned().unwrap_or_default(),
                    cache_millis: state.cache_millis,
                    hosts,
                    last_ref_time: chrono::Utc::now().timestamp_millis(),
                    checksum: format!("{}-{}", key, revision),
                    ..Default::default()
                };
                ResponseTemplate::new(200).set_body_json(info)
            }
            ("GET", "/v1/ns/service") => match state.services.get(&key) {
                Some(_) => {
                    let (group, name) = key.split_once(SERVICE_INFO_SPLITER).unwrap_or_default();
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "namespaceId": params.get("namespaceId").cloned().unwrap_or_default(),
                        "groupName": group,
                        "name": name,
                        "protectThreshold": 0.0,
                        "metadata": {},
                        "clusters": [{"name": "DEFAULT", "metadata": {}}]
                    }))
                }
                None => ResponseTemplate::new(404).set_body_string("service not found"),
            },
            ("GET", "/v1/ns/service/list") => {
                let group = params
                    .get("groupName")
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_GROUP.to_string());
                let prefix = format!("{}{}", group, SERVICE_INFO_SPLITER);
                let mut names: Vec<String> = state
                    .services
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect();
                names.sort();
                let page_no: usize = params
                    .get("pageNo")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(1);
                let page_size: usize = params
                    .get("pageSize")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(10);
                let doms: Vec<String> = names
                    .iter()
                    .skip((page_no.max(1) - 1) * page_size)
                    .take(page_size)
                    .cloned()
                    .collect();
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "count": names.len(),
                    "doms": doms
                }))
            }
            _ => ResponseTemplate::new(404).set_body_string("no such route"),
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
