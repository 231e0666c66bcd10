//! Heartbeat scheduling for registered instances
//!
//! Every ephemeral instance registered through this client gets a task that
//! beats on a fixed period. Consecutive misses mark the instance unhealthy
//! locally; it stays registered and flips back on the next acknowledged beat.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use sregistry_api::naming::{BeatResult, HealthStatus, Instance, grouped_name, instance_key};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::metrics::MetricsMonitor;
use crate::naming::cache::DiscoveryCache;
use crate::naming::listener::InstanceHealthEvent;
use crate::naming::proxy::NamingProxy;

const HEALTH_EVENT_CAPACITY: usize = 256;

/// An instance registered through this client, with its locally observed health
#[derive(Clone, Debug, PartialEq)]
pub struct RegisteredInstance {
    pub service_name: String,
    pub group_name: String,
    pub instance: Instance,
    pub health: HealthStatus,
    pub missed_beats: u32,
}

/// Tracking key of an instance: `group@@service#ip#port`
pub fn tracking_key(group_name: &str, service_name: &str, ip: &str, port: u16) -> String {
    format!("{}#{}", grouped_name(group_name, service_name), instance_key(ip, port))
}

struct BeatTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct BeatContext {
    proxy: NamingProxy,
    cache: Arc<DiscoveryCache>,
    registered: DashMap<String, RegisteredInstance>,
    events: broadcast::Sender<InstanceHealthEvent>,
    max_missed: u32,
    metrics: Arc<MetricsMonitor>,
}

/// Tracks registered instances and runs their heartbeat tasks
pub struct HeartbeatScheduler {
    ctx: Arc<BeatContext>,
    tasks: DashMap<String, BeatTask>,
    interval: Duration,
    root: CancellationToken,
}

impl HeartbeatScheduler {
    pub fn new(
        proxy: NamingProxy,
        cache: Arc<DiscoveryCache>,
        interval: Duration,
        max_missed: u32,
        metrics: Arc<MetricsMonitor>,
        root: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        Self {
            ctx: Arc::new(BeatContext {
                proxy,
                cache,
                registered: DashMap::new(),
                events,
                max_missed: max_missed.max(1),
                metrics,
            }),
            tasks: DashMap::new(),
            interval,
            root,
        }
    }

    fn key_of(&self, service_name: &str, ip: &str, port: u16) -> String {
        tracking_key(self.ctx.proxy.group_name(), service_name, ip, port)
    }

    /// Record a registration; an existing entry keeps its health state and
    /// only takes the new attributes
    pub fn track(&self, service_name: &str, instance: Instance) -> String {
        let key = self.key_of(service_name, &instance.ip, instance.port);
        self.ctx
            .registered
            .entry(key.clone())
            .and_modify(|tracked| tracked.instance = instance.clone())
            .or_insert_with(|| RegisteredInstance {
                service_name: service_name.to_string(),
                group_name: self.ctx.proxy.group_name().to_string(),
                instance,
                health: HealthStatus::Healthy,
                missed_beats: 0,
            });
        key
    }

    /// Put back a previously removed entry unchanged
    pub fn restore(&self, key: &str, tracked: RegisteredInstance) {
        self.ctx.registered.insert(key.to_string(), tracked);
    }

    pub fn untrack(&self, service_name: &str, ip: &str, port: u16) -> Option<(String, RegisteredInstance)> {
        let key = self.key_of(service_name, ip, port);
        self.ctx.registered.remove(&key)
    }

    pub fn get(&self, service_name: &str, ip: &str, port: u16) -> Option<RegisteredInstance> {
        let key = self.key_of(service_name, ip, port);
        self.ctx.registered.get(&key).map(|t| t.clone())
    }

    /// All tracked instances, ordered by key
    pub fn registered(&self) -> Vec<RegisteredInstance> {
        let mut all: Vec<(String, RegisteredInstance)> = self
            .ctx
            .registered
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().map(|(_, t)| t).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceHealthEvent> {
        self.ctx.events.subscribe()
    }

    pub fn is_beating(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// Start the heartbeat task of a tracked instance unless it already runs
    pub fn start(&self, key: &str) {
        if self.root.is_cancelled() {
            return;
        }
        self.tasks.entry(key.to_string()).or_insert_with(|| {
            let token = self.root.child_token();
            let ctx = self.ctx.clone();
            let key = key.to_string();
            let task_token = token.clone();
            let interval = self.interval;
            debug!(instance = %key, "Starting heartbeat every {:?}", interval);
            let handle = tokio::spawn(async move { ctx.run(key, interval, task_token).await });
            BeatTask { token, handle }
        });
    }

    /// Cancel the heartbeat task and wait until it has stopped
    pub async fn stop(&self, key: &str) {
        if let Some((_, task)) = self.tasks.remove(key) {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(instance = %key, "Heartbeat task ended abnormally: {}", e);
            }
        }
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, task)) = self.tasks.remove(&key) {
                task.token.cancel();
                handles.push(task.handle);
            }
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }

    /// Send one beat for a tracked instance outside the schedule
    pub async fn beat_now(&self, service_name: &str, ip: &str, port: u16) -> Result<BeatResult> {
        let key = self.key_of(service_name, ip, port);
        let tracked = self.ctx.registered.get(&key).map(|t| t.clone()).ok_or_else(|| {
            ClientError::InstanceNotFound {
                service: service_name.to_string(),
                ip: ip.to_string(),
                port,
            }
        })?;
        self.ctx.beat_once(&key, &tracked).await
    }
}

impl BeatContext {
    async fn run(self: Arc<Self>, key: String, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Re-read every tick so re-registrations take effect
            let Some(tracked) = self.registered.get(&key).map(|t| t.clone()) else {
                break;
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.beat_once(&key, &tracked) => {
                    if let Err(e) = result {
                        warn!(instance = %key, "Heartbeat failed: {}", e);
                    }
                }
            }
        }

        debug!(instance = %key, "Heartbeat stopped");
    }

    async fn beat_once(&self, key: &str, tracked: &RegisteredInstance) -> Result<BeatResult> {
        let service_name = tracked.service_name.as_str();
        let instance = &tracked.instance;

        let result = match self.proxy.send_beat(service_name, instance).await {
            Ok(result) if result.is_resource_not_found() => {
                info!(
                    instance = %key,
                    "Registry no longer knows the instance, registering again"
                );
                self.proxy.register(service_name, instance).await.map(|_| result)
            }
            other => other,
        };

        match result {
            Ok(result) => {
                self.on_ack(key);
                Ok(result)
            }
            Err(e) => {
                self.on_miss(key);
                Err(e)
            }
        }
    }

    fn on_ack(&self, key: &str) {
        let recovered = match self.registered.get_mut(key) {
            Some(mut tracked) => {
                tracked.missed_beats = 0;
                if tracked.health == HealthStatus::Unhealthy {
                    tracked.health = HealthStatus::Healthy;
                    Some(tracked.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(tracked) = recovered {
            info!(instance = %key, "Heartbeat acknowledged again, instance is healthy");
            self.transition(&tracked);
        }
    }

    fn on_miss(&self, key: &str) {
        let failed = match self.registered.get_mut(key) {
            Some(mut tracked) => {
                tracked.missed_beats = tracked.missed_beats.saturating_add(1);
                self.metrics.increment_heartbeat_miss(&tracked.service_name);
                if tracked.health == HealthStatus::Healthy && tracked.missed_beats >= self.max_missed {
                    tracked.health = HealthStatus::Unhealthy;
                    Some(tracked.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(tracked) = failed {
            warn!(
                instance = %key,
                missed = tracked.missed_beats,
                "Too many missed heartbeats, marking instance unhealthy"
            );
            self.transition(&tracked);
        }
    }

    fn transition(&self, tracked: &RegisteredInstance) {
        let cache_key = grouped_name(&tracked.group_name, &tracked.service_name);
        self.cache.set_local_health(
            &cache_key,
            &tracked.instance.ip,
            tracked.instance.port,
            tracked.health,
        );

        // No receivers is fine
        let _ = self.events.send(InstanceHealthEvent::new(
            &tracked.service_name,
            &tracked.group_name,
            &tracked.instance.ip,
            tracked.instance.port,
            tracked.health,
            tracked.missed_beats,
        ));
    }
}
