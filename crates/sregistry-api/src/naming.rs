// Naming API models for service registration and discovery
// Request/response structures of the v1 naming HTTP endpoints

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{DEFAULT_CLUSTER, DEFAULT_GROUP, SERVICE_INFO_SPLITER};

// API paths, relative to the context path
pub const INSTANCE_PATH: &str = "/v1/ns/instance";
pub const INSTANCE_BEAT_PATH: &str = "/v1/ns/instance/beat";
pub const INSTANCE_LIST_PATH: &str = "/v1/ns/instance/list";
pub const SERVICE_PATH: &str = "/v1/ns/service";
pub const SERVICE_LIST_PATH: &str = "/v1/ns/service/list";

// Beat result codes
pub const BEAT_OK: i32 = 10200;
pub const BEAT_RESOURCE_NOT_FOUND: i32 = 20404;

/// Default beat period reported to the server (milliseconds)
pub const DEFAULT_HEART_BEAT_INTERVAL_MS: u64 = 5000;

/// Health of an instance as seen by the registry or by the local client.
///
/// Travels as the boolean `healthy` field on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl From<HealthStatus> for bool {
    fn from(status: HealthStatus) -> Self {
        status.is_healthy()
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("HEALTHY"),
            HealthStatus::Unhealthy => f.write_str("UNHEALTHY"),
        }
    }
}

// Service instance information
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    #[serde(rename = "healthy")]
    pub health: HealthStatus,
    pub enabled: bool,
    pub ephemeral: bool,
    pub cluster_name: String,
    /// Single-instance lookups name it `service`
    #[serde(alias = "service")]
    pub service_name: String,
    pub metadata: HashMap<String, String>,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            ip: String::new(),
            port: 0,
            weight: 1.0,
            health: HealthStatus::Healthy,
            enabled: true,
            ephemeral: true,
            cluster_name: DEFAULT_CLUSTER.to_string(),
            service_name: String::new(),
            metadata: HashMap::new(),
        }
    }
}

impl Instance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    /// Instance identity within a service: `ip#port`
    pub fn key(&self) -> String {
        instance_key(&self.ip, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Healthy and enabled, i.e. eligible to receive traffic
    pub fn is_available(&self) -> bool {
        self.is_healthy() && self.enabled
    }

    /// Same instance identity (ip, port) regardless of attributes
    pub fn same_address(&self, ip: &str, port: u16) -> bool {
        self.ip == ip && self.port == port
    }
}

/// Instance list of one service, `GET /v1/ns/instance/list`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfo {
    pub name: String,
    pub group_name: String,
    pub clusters: String,
    pub cache_millis: u64,
    pub hosts: Vec<Instance>,
    pub last_ref_time: i64,
    pub checksum: String,
    pub reach_protection_threshold: bool,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            group_name: String::new(),
            clusters: String::new(),
            cache_millis: 10000,
            hosts: Vec::new(),
            last_ref_time: 0,
            checksum: String::new(),
            reach_protection_threshold: false,
        }
    }
}

impl ServiceInfo {
    /// Service name without the `group@@` prefix some servers return
    pub fn plain_name(&self) -> &str {
        split_grouped_name(&self.name).1
    }
}

/// Beat payload sent as the `beat` JSON parameter of `PUT /v1/ns/instance/beat`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeatInfo {
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub service_name: String,
    pub cluster: String,
    pub metadata: HashMap<String, String>,
    pub scheduled: bool,
    pub period: u64,
    pub stopped: bool,
}

impl BeatInfo {
    pub fn from_instance(grouped_service_name: &str, instance: &Instance, period_ms: u64) -> Self {
        Self {
            ip: instance.ip.clone(),
            port: instance.port,
            weight: instance.weight,
            service_name: grouped_service_name.to_string(),
            cluster: instance.cluster_name.clone(),
            metadata: instance.metadata.clone(),
            scheduled: false,
            period: period_ms,
            stopped: false,
        }
    }
}

/// Response of `PUT /v1/ns/instance/beat`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeatResult {
    pub client_beat_interval: i64,
    pub code: i32,
    pub light_beat_enabled: bool,
}

impl BeatResult {
    pub fn is_resource_not_found(&self) -> bool {
        self.code == BEAT_RESOURCE_NOT_FOUND
    }
}

// Cluster entry of a service detail
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterInfo {
    pub name: String,
    pub metadata: HashMap<String, String>,
}

/// Service detail, `GET /v1/ns/service`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDetail {
    pub namespace_id: String,
    pub group_name: String,
    pub name: String,
    pub protect_threshold: f32,
    pub metadata: HashMap<String, String>,
    pub clusters: Vec<ClusterInfo>,
}

/// Paged service names, `GET /v1/ns/service/list`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceList {
    pub count: u64,
    pub doms: Vec<String>,
}

/// Build the `group@@service` form used on the wire and as cache key
pub fn grouped_name(group_name: &str, service_name: &str) -> String {
    format!("{}{}{}", group_name, SERVICE_INFO_SPLITER, service_name)
}

/// Split `group@@service`; a bare name belongs to the default group
pub fn split_grouped_name(name: &str) -> (&str, &str) {
    match name.split_once(SERVICE_INFO_SPLITER) {
        Some((group, service)) => (group, service),
        None => (DEFAULT_GROUP, name),
    }
}

pub fn instance_key(ip: &str, port: u16) -> String {
    format!("{}#{}", ip, port)
}
