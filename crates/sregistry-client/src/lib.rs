//! sregistry Client - Rust SDK for Nacos-compatible service registries
//!
//! This crate provides:
//! - HTTP transport with request signing, retry, and endpoint failover
//! - Credential providers for access/secret keys and login tokens
//! - `NamingService` for instance registration, heartbeats, and discovery
//! - A discovery cache with change subscriptions and disk failover
//! - Prometheus metrics for requests, failovers, and heartbeats

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod naming;

pub use auth::{CredentialProvider, StaticKeyProvider, TokenProvider};
pub use config::{ClientConfig, Endpoint, Scheme};
pub use error::{ClientError, Result};
pub use http::{RegistryHttpClient, RegistryRequest, TransportResponse};
pub use metrics::{MetricsMonitor, Timer};
pub use naming::NamingService;
pub use naming::beat::RegisteredInstance;
pub use naming::cache::ServiceSnapshot;
pub use naming::listener::{
    EventListener, FnEventListener, InstanceHealthEvent, NamingEvent, SubscriptionId,
};

// Wire models used in the public API
pub use sregistry_api::naming::{HealthStatus, Instance, ServiceDetail, ServiceList};
