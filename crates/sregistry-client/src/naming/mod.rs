//! Service discovery (naming) service
//!
//! Provides `NamingService` for instance registration/deregistration,
//! heartbeats, cached discovery with change subscriptions, and service
//! queries against a Nacos-compatible registry over HTTP.

pub mod balancer;
pub mod beat;
pub mod cache;
pub mod failover;
pub mod listener;
pub mod proxy;
pub mod refresh;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use sregistry_api::naming::{HealthStatus, Instance, ServiceDetail, ServiceList, grouped_name};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::http::RegistryHttpClient;
use crate::metrics::MetricsMonitor;

use self::balancer::Balancer;
use self::beat::{HeartbeatScheduler, RegisteredInstance};
use self::cache::{DiscoveryCache, ServiceSnapshot};
use self::failover::FailoverReactor;
use self::listener::{EventListener, FnEventListener, InstanceHealthEvent, NamingEvent, SubscriptionId};
use self::proxy::NamingProxy;
use self::refresh::RefreshWorker;

/// Nacos-compatible naming client backed by the v1 HTTP API.
///
/// Background work (heartbeats, discovery refresh) runs on the tokio runtime
/// the client was first used on. Call [`NamingService::shutdown`] to stop it
/// and deregister the instances this client registered.
pub struct NamingService {
    config: ClientConfig,
    proxy: NamingProxy,
    cache: Arc<DiscoveryCache>,
    heartbeats: HeartbeatScheduler,
    refresher: RefreshWorker,
    metrics: Arc<MetricsMonitor>,
    shutdown_token: CancellationToken,
    closed: AtomicBool,
}

impl NamingService {
    /// Create a naming service. No request is sent until the first call.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsMonitor::new().map_err(|e| ClientError::Other(e.into()))?);
        let transport = Arc::new(RegistryHttpClient::new(&config, metrics.clone())?);
        let proxy = NamingProxy::new(
            transport,
            &config.namespace,
            &config.group_name,
            config.read_timeout(),
            config.heartbeat_interval_ms,
        );

        let failover = config
            .cache_dir
            .as_deref()
            .map(|dir| FailoverReactor::new(dir, &config.namespace));
        let cache = Arc::new(DiscoveryCache::new(
            config.cache_ttl(),
            failover,
            metrics.clone(),
        ));

        let shutdown_token = CancellationToken::new();
        let heartbeats = HeartbeatScheduler::new(
            proxy.clone(),
            cache.clone(),
            config.heartbeat_interval(),
            config.max_missed_heartbeats,
            metrics.clone(),
            shutdown_token.child_token(),
        );
        let refresher = RefreshWorker::new(
            proxy.clone(),
            cache.clone(),
            config.long_poll_timeout(),
            std::time::Duration::from_millis(config.retry_backoff_ms),
            std::time::Duration::from_millis(config.max_retry_backoff_ms),
            config.cache_ttl(),
            shutdown_token.child_token(),
        );

        info!(
            endpoints = ?config.server_addrs,
            namespace = %config.namespace,
            "Naming service created"
        );

        Ok(Self {
            config,
            proxy,
            cache,
            heartbeats,
            refresher,
            metrics,
            shutdown_token,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsMonitor> {
        &self.metrics
    }

    /// The endpoint the next registry call starts with
    pub fn current_endpoint(&self) -> String {
        self.proxy.transport().current_endpoint().to_string()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Shutdown);
        }
        Ok(())
    }

    fn key(&self, service_name: &str) -> String {
        grouped_name(&self.config.group_name, service_name)
    }

    fn validate_service(service_name: &str) -> Result<()> {
        sregistry_api::validate_service_name(service_name)?;
        Ok(())
    }

    // ============== Instance registration ==============

    /// Register an ephemeral instance with weight 1.0 and no metadata
    pub async fn register_instance(&self, service_name: &str, ip: &str, port: u16) -> Result<()> {
        let instance = Instance::new(ip, port).with_cluster(self.config.cluster_name.clone());
        self.register(service_name, instance).await
    }

    /// Register an instance.
    ///
    /// Registering the same (service, ip, port) again updates the tracked
    /// attributes in place and keeps the running heartbeat.
    pub async fn register(&self, service_name: &str, mut instance: Instance) -> Result<()> {
        self.ensure_running()?;
        if instance.cluster_name.is_empty() {
            instance.cluster_name = self.config.cluster_name.clone();
        }
        sregistry_api::validate_instance(service_name, &instance)?;

        self.proxy.register(service_name, &instance).await?;

        let ephemeral = instance.ephemeral;
        let key = self.heartbeats.track(service_name, instance);
        if ephemeral {
            self.heartbeats.start(&key);
        }
        Ok(())
    }

    /// Deregister an instance registered through this client.
    ///
    /// Its heartbeat has stopped when this returns. If the registry call
    /// fails the instance stays tracked and keeps beating.
    pub async fn deregister_instance(&self, service_name: &str, ip: &str, port: u16) -> Result<()> {
        self.ensure_running()?;

        let Some((key, tracked)) = self.heartbeats.untrack(service_name, ip, port) else {
            return Err(ClientError::InstanceNotFound {
                service: service_name.to_string(),
                ip: ip.to_string(),
                port,
            });
        };
        self.heartbeats.stop(&key).await;

        match self.proxy.deregister(service_name, &tracked.instance).await {
            Ok(()) => {}
            Err(ClientError::InstanceNotFound { .. }) => {
                debug!(instance = %key, "Registry had already dropped the instance");
            }
            Err(e) => {
                warn!(instance = %key, "Deregister failed, keeping instance registered: {}", e);
                let ephemeral = tracked.instance.ephemeral;
                self.heartbeats.restore(&key, tracked);
                if ephemeral {
                    self.heartbeats.start(&key);
                }
                return Err(e);
            }
        }

        self.cache
            .set_local_health(&self.key(service_name), ip, port, HealthStatus::Healthy);
        Ok(())
    }

    /// Send one heartbeat for a tracked instance now
    pub async fn heartbeat(&self, service_name: &str, ip: &str, port: u16) -> Result<()> {
        self.ensure_running()?;
        self.heartbeats.beat_now(service_name, ip, port).await?;
        Ok(())
    }

    /// Change weight, metadata, or enabled flag of an instance
    pub async fn update_instance(&self, service_name: &str, mut instance: Instance) -> Result<()> {
        self.ensure_running()?;
        if instance.cluster_name.is_empty() {
            instance.cluster_name = self.config.cluster_name.clone();
        }
        sregistry_api::validate_instance(service_name, &instance)?;

        self.proxy.update_instance(service_name, &instance).await?;

        if self
            .heartbeats
            .get(service_name, &instance.ip, instance.port)
            .is_some()
        {
            self.heartbeats.track(service_name, instance);
        }
        Ok(())
    }

    /// Instances registered through this client and their local health
    pub fn registered_instances(&self) -> Vec<RegisteredInstance> {
        self.heartbeats.registered()
    }

    /// Locally observed health of a registered instance
    pub fn instance_health(&self, service_name: &str, ip: &str, port: u16) -> Option<HealthStatus> {
        self.heartbeats
            .get(service_name, ip, port)
            .map(|tracked| tracked.health)
    }

    /// Health transitions decided by the heartbeat scheduler
    pub fn subscribe_health_events(&self) -> broadcast::Receiver<InstanceHealthEvent> {
        self.heartbeats.subscribe()
    }

    // ============== Discovery ==============

    /// Instances of a service from the cache.
    ///
    /// Missing or expired entries are refreshed first. When that fails the
    /// old entry, or the on-disk copy, is returned marked stale.
    pub async fn get_instances(&self, service_name: &str, healthy_only: bool) -> Result<ServiceSnapshot> {
        self.ensure_running()?;
        Self::validate_service(service_name)?;

        let key = self.key(service_name);
        let cached = self.cache.get(&key);
        let snapshot = match cached {
            Some(snapshot) if !self.cache.is_expired(&snapshot) => Ok(snapshot),
            cached => match self.refresher.refresh_now(service_name).await {
                Ok(snapshot) => Ok(snapshot),
                Err(e) => {
                    if let Some(snapshot) = cached {
                        warn!(service = %key, "Refresh failed, serving stale snapshot: {}", e);
                        Ok(Arc::new(snapshot.as_stale()))
                    } else if let Some(snapshot) = self
                        .cache
                        .load_failover(&self.config.group_name, service_name)
                    {
                        warn!(service = %key, "Refresh failed, serving failover snapshot: {}", e);
                        Ok(snapshot)
                    } else {
                        Err(e)
                    }
                }
            },
        };

        self.refresher.ensure(service_name);

        let snapshot = snapshot?;
        Ok(if healthy_only {
            snapshot.healthy_only()
        } else {
            (*snapshot).clone()
        })
    }

    /// Fetch the instance list now, bypassing the cache
    pub async fn refresh(&self, service_name: &str) -> Result<ServiceSnapshot> {
        self.ensure_running()?;
        Self::validate_service(service_name)?;
        let snapshot = self.refresher.refresh_now(service_name).await?;
        Ok((*snapshot).clone())
    }

    /// Weighted random pick among healthy, enabled instances
    pub async fn select_one_healthy_instance(&self, service_name: &str) -> Result<Instance> {
        let snapshot = self.get_instances(service_name, true).await?;
        Balancer::select_host(&snapshot).ok_or_else(|| ClientError::NoHealthyInstance {
            service: service_name.to_string(),
        })
    }

    /// Be notified of every change of a service's instance list.
    ///
    /// The current list is fetched first; listeners run in subscription order.
    pub async fn subscribe(
        &self,
        service_name: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<SubscriptionId> {
        self.ensure_running()?;
        Self::validate_service(service_name)?;

        if let Err(e) = self.get_instances(service_name, false).await {
            warn!(service = %service_name, "Initial fetch for subscription failed: {}", e);
        }

        let id = self.cache.subscribe(&self.key(service_name), listener);
        self.refresher.ensure(service_name);
        debug!(service = %service_name, subscription = %id, "Subscribed");
        Ok(id)
    }

    /// Subscribe with a closure
    pub async fn subscribe_fn<F>(&self, service_name: &str, f: F) -> Result<SubscriptionId>
    where
        F: Fn(NamingEvent) + Send + Sync + 'static,
    {
        self.subscribe(service_name, Arc::new(FnEventListener::new(f)))
            .await
    }

    /// Remove a subscription; the listener is not invoked after this returns
    pub fn unsubscribe(&self, service_name: &str, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(&self.key(service_name), id)
    }

    // ============== Service queries ==============

    /// One instance as the registry currently records it, in the configured
    /// cluster. `InstanceNotFound` when the registry has no such instance.
    pub async fn get_instance(&self, service_name: &str, ip: &str, port: u16) -> Result<Instance> {
        self.ensure_running()?;
        Self::validate_service(service_name)?;
        sregistry_api::validate_ip(ip)?;
        sregistry_api::validate_port(port)?;

        self.proxy
            .get_instance(service_name, ip, port, &self.config.cluster_name, false)
            .await
    }

    pub async fn get_service(&self, service_name: &str) -> Result<ServiceDetail> {
        self.ensure_running()?;
        Self::validate_service(service_name)?;
        self.proxy.get_service(service_name).await
    }

    /// One page of service names in the configured namespace and group
    pub async fn list_services(&self, page_no: u32, page_size: u32) -> Result<ServiceList> {
        self.ensure_running()?;
        self.proxy.list_services(page_no, page_size).await
    }

    // ============== Lifecycle ==============

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop all background tasks, then deregister every tracked instance.
    ///
    /// Deregistration is best effort: failures are logged. Calling this more
    /// than once is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down naming service");

        self.shutdown_token.cancel();
        self.heartbeats.stop_all().await;
        self.refresher.stop_all().await;

        let registered = self.heartbeats.registered();
        let results = join_all(registered.iter().map(|tracked| {
            self.proxy
                .deregister(&tracked.service_name, &tracked.instance)
        }))
        .await;

        let mut failed = 0usize;
        for (tracked, result) in registered.iter().zip(results) {
            match result {
                Ok(()) | Err(ClientError::InstanceNotFound { .. }) => {
                    self.heartbeats.untrack(
                        &tracked.service_name,
                        &tracked.instance.ip,
                        tracked.instance.port,
                    );
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        service = %tracked.service_name,
                        ip = %tracked.instance.ip,
                        port = tracked.instance.port,
                        "Failed to deregister on shutdown: {}", e
                    );
                }
            }
        }

        info!(
            deregistered = registered.len() - failed,
            failed, "Naming service shut down"
        );
    }
}

impl Drop for NamingService {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
