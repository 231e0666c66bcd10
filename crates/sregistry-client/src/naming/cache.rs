//! Discovery cache
//!
//! Holds the latest instance list of every discovered service as an
//! immutable [`ServiceSnapshot`] behind an `Arc`. Snapshots are replaced
//! whole, so a reader holds either the old list or the new one.
//!
//! Each service keeps two snapshots: the one the registry returned and the
//! one served to callers, which additionally carries local health overrides
//! set by the heartbeat scheduler.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sregistry_api::naming::{HealthStatus, Instance, ServiceInfo, grouped_name, instance_key};
use tracing::{debug, warn};

use crate::metrics::MetricsMonitor;
use crate::naming::failover::FailoverReactor;
use crate::naming::listener::{EventListener, NamingEvent, SubscriptionId};

/// Point-in-time instance list of one service
#[derive(Clone, Debug)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub group_name: String,
    /// In registry order
    pub instances: Vec<Instance>,
    /// Server checksum; empty when the server sent none
    pub revision: String,
    /// Refresh hint from the server
    pub cache_millis: u64,
    /// Server-side timestamp of the list
    pub last_ref_time: i64,
    /// When this client fetched the list
    pub refreshed_at: Instant,
    /// Served from an expired or on-disk copy because refreshing failed
    pub stale: bool,
}

impl ServiceSnapshot {
    pub fn from_service_info(group_name: &str, service_name: &str, info: ServiceInfo) -> Self {
        Self {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            instances: info.hosts,
            revision: info.checksum,
            cache_millis: info.cache_millis,
            last_ref_time: info.last_ref_time,
            refreshed_at: Instant::now(),
            stale: false,
        }
    }

    pub fn to_service_info(&self) -> ServiceInfo {
        ServiceInfo {
            name: grouped_name(&self.group_name, &self.service_name),
            group_name: self.group_name.clone(),
            cache_millis: self.cache_millis,
            hosts: self.instances.clone(),
            last_ref_time: self.last_ref_time,
            checksum: self.revision.clone(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        grouped_name(&self.group_name, &self.service_name)
    }

    /// Copy with only healthy, enabled instances, order preserved
    pub fn healthy_only(&self) -> Self {
        Self {
            instances: self
                .instances
                .iter()
                .filter(|i| i.is_available())
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    pub fn as_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }

    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }

    fn same_content(&self, other: &ServiceSnapshot) -> bool {
        self.revision == other.revision && self.instances == other.instances
    }

    fn to_event(&self) -> NamingEvent {
        NamingEvent {
            service_name: self.service_name.clone(),
            group_name: self.group_name.clone(),
            revision: self.revision.clone(),
            instances: self.instances.clone(),
        }
    }
}

struct CacheEntry {
    /// As returned by the registry
    raw: Arc<ServiceSnapshot>,
    /// With local health overrides applied
    served: Arc<ServiceSnapshot>,
}

type ListenerList = Vec<(SubscriptionId, Arc<dyn EventListener>)>;

/// Per-service snapshots, subscriptions, and local health overrides
pub struct DiscoveryCache {
    /// key = "groupName@@serviceName"
    entries: DashMap<String, CacheEntry>,
    /// Held while a snapshot is replaced and its listeners run
    listeners: DashMap<String, Arc<Mutex<ListenerList>>>,
    /// Instance keys (`ip#port`) marked unhealthy by missed heartbeats
    unhealthy: DashMap<String, HashSet<String>>,
    next_id: AtomicU64,
    failover: Option<FailoverReactor>,
    metrics: Arc<MetricsMonitor>,
    ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration, failover: Option<FailoverReactor>, metrics: Arc<MetricsMonitor>) -> Self {
        Self {
            entries: DashMap::new(),
            listeners: DashMap::new(),
            unhealthy: DashMap::new(),
            next_id: AtomicU64::new(1),
            failover,
            metrics,
            ttl,
        }
    }

    /// Get the served snapshot of a service
    pub fn get(&self, key: &str) -> Option<Arc<ServiceSnapshot>> {
        self.entries.get(key).map(|e| e.served.clone())
    }

    /// Revision of the last snapshot the registry returned
    pub fn revision(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.raw.revision.clone())
    }

    /// Older than the hard TTL
    pub fn is_expired(&self, snapshot: &ServiceSnapshot) -> bool {
        snapshot.age() > self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn listener_list(&self, key: &str) -> Arc<Mutex<ListenerList>> {
        self.listeners
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Replace the snapshot of a service with one fetched from the registry.
    ///
    /// Returns the served snapshot and whether its content changed; listeners
    /// are notified, in subscription order, only on change. A snapshot the
    /// registry produced before the cached one (`last_ref_time`) is dropped
    /// and the cached one returned.
    pub fn publish(&self, raw: ServiceSnapshot) -> (Arc<ServiceSnapshot>, bool) {
        let key = raw.key();
        let listeners = self.listener_list(&key);
        let listeners = listeners.lock();

        if let Some(current) = self
            .entries
            .get(&key)
            .filter(|e| e.raw.last_ref_time > raw.last_ref_time)
            .map(|e| e.served.clone())
        {
            debug!(
                service = %key,
                revision = %raw.revision,
                current = %current.revision,
                "Dropping out-of-date snapshot"
            );
            return (current, false);
        }

        let raw = Arc::new(raw);
        let (served, changed) = self.replace(&key, raw);
        if changed {
            self.save_failover(&key, &served);
            dispatch(&listeners, &served);
        }
        (served, changed)
    }

    /// Re-derive the served snapshot after the overrides changed
    fn republish(&self, key: &str) {
        let listeners = self.listener_list(key);
        let listeners = listeners.lock();

        let Some(raw) = self.entries.get(key).map(|e| e.raw.clone()) else {
            return;
        };
        let (served, changed) = self.replace(key, raw);
        if changed {
            dispatch(&listeners, &served);
        }
    }

    // Caller holds the service's listener lock
    fn replace(&self, key: &str, raw: Arc<ServiceSnapshot>) -> (Arc<ServiceSnapshot>, bool) {
        let served = Arc::new(self.apply_overrides(key, &raw));
        let changed = match self.entries.get(key) {
            Some(previous) => !previous.served.same_content(&served),
            None => true,
        };

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                raw,
                served: served.clone(),
            },
        );
        self.metrics.set_cached_services(self.entries.len());

        if changed {
            debug!(
                service = %key,
                revision = %served.revision,
                instances = served.instances.len(),
                "Service snapshot changed"
            );
        }
        (served, changed)
    }

    fn apply_overrides(&self, key: &str, raw: &ServiceSnapshot) -> ServiceSnapshot {
        let mut served = raw.clone();
        if let Some(down) = self.unhealthy.get(key) {
            for instance in served.instances.iter_mut() {
                if down.contains(&instance.key()) {
                    instance.health = HealthStatus::Unhealthy;
                }
            }
        }
        served
    }

    fn save_failover(&self, key: &str, snapshot: &ServiceSnapshot) {
        if let Some(failover) = &self.failover {
            let raw = self.entries.get(key).map(|e| e.raw.clone());
            let info = raw.as_deref().unwrap_or(snapshot).to_service_info();
            if let Err(e) = failover.save_failover(key, &info) {
                warn!(service = %key, "Failed to write failover snapshot: {}", e);
            }
        }
    }

    /// Read the on-disk copy of a service, marked stale
    pub fn load_failover(&self, group_name: &str, service_name: &str) -> Option<Arc<ServiceSnapshot>> {
        let failover = self.failover.as_ref()?;
        let key = grouped_name(group_name, service_name);
        match failover.load_failover(&key) {
            Ok(Some(info)) => {
                let raw = ServiceSnapshot::from_service_info(group_name, service_name, info);
                Some(Arc::new(self.apply_overrides(&key, &raw).as_stale()))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(service = %key, "Failed to read failover snapshot: {}", e);
                None
            }
        }
    }

    /// Override the health of one instance as seen through this cache.
    ///
    /// `Healthy` removes the override and the registry's view applies again.
    pub fn set_local_health(&self, key: &str, ip: &str, port: u16, status: HealthStatus) {
        let id = instance_key(ip, port);
        let updated = match status {
            HealthStatus::Unhealthy => self.unhealthy.entry(key.to_string()).or_default().insert(id),
            HealthStatus::Healthy => {
                let removed = self
                    .unhealthy
                    .get_mut(key)
                    .map(|mut set| set.remove(&id))
                    .unwrap_or(false);
                self.unhealthy.remove_if(key, |_, set| set.is_empty());
                removed
            }
        };

        if updated {
            self.republish(key);
        }
    }

    /// Register a listener for changes of one service
    pub fn subscribe(&self, key: &str, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listener_list(key).lock().push((id, listener));
        id
    }

    /// Remove a listener; no invocation of it starts after this returns
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let Some(listeners) = self.listeners.get(key).map(|l| l.clone()) else {
            return false;
        };
        let mut listeners = listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.listeners
            .get(key)
            .map(|l| l.lock().len())
            .unwrap_or(0)
    }
}

fn dispatch(listeners: &ListenerList, snapshot: &ServiceSnapshot) {
    if listeners.is_empty() {
        return;
    }
    let event = snapshot.to_event();
    for (_, listener) in listeners.iter() {
        listener.on_event(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::listener::FnEventListener;

    fn cache() -> DiscoveryCache {
        DiscoveryCache::new(
            Duration::from_secs(90),
            None,
            Arc::new(MetricsMonitor::new().unwrap()),
        )
    }

    fn snapshot(revision: &str, ports: &[u16]) -> ServiceSnapshot {
        ServiceSnapshot {
            service_name: "svc".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            instances: ports.iter().map(|p| Instance::new("127.0.0.1", *p)).collect(),
            revision: revision.to_string(),
            cache_millis: 10000,
            last_ref_time: 0,
            refreshed_at: Instant::now(),
            stale: false,
        }
    }

    fn recording_listener(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn EventListener> {
        Arc::new(FnEventListener::new(move |event: NamingEvent| {
            log.lock().push(format!("{}:{}", tag, event.revision));
        }))
    }

    const KEY: &str = "DEFAULT_GROUP@@svc";

    #[test]
    fn test_publish_detects_change() {
        let cache = cache();
        let (_, changed) = cache.publish(snapshot("r1", &[1, 2]));
        assert!(changed);
        let (_, changed) = cache.publish(snapshot("r1", &[1, 2]));
        assert!(!changed);
        let (served, changed) = cache.publish(snapshot("r2", &[1, 2, 3]));
        assert!(changed);
        assert_eq!(served.instances.len(), 3);
        assert_eq!(cache.revision(KEY).as_deref(), Some("r2"));
        assert_eq!(cache.metrics.cached_service_count.get(), 1);
    }

    #[test]
    fn test_out_of_date_snapshot_is_dropped() {
        let cache = cache();
        let log = Arc::new(Mutex::new(Vec::new()));
        cache.subscribe(KEY, recording_listener(log.clone(), "a"));

        let mut newer = snapshot("r2", &[1, 2]);
        newer.last_ref_time = 200;
        let mut older = snapshot("r1", &[1]);
        older.last_ref_time = 100;

        cache.publish(newer);
        let (served, changed) = cache.publish(older);
        assert!(!changed);
        assert_eq!(served.revision, "r2");
        assert_eq!(cache.revision(KEY).as_deref(), Some("r2"));
        assert_eq!(cache.get(KEY).unwrap().instances.len(), 2);
        assert_eq!(*log.lock(), vec!["a:r2"]);

        // same server time is not older
        let mut same = snapshot("r3", &[1]);
        same.last_ref_time = 200;
        assert!(cache.publish(same).1);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = cache();
        cache.publish(snapshot("r1", &[1, 2]));
        let held = cache.get(KEY).unwrap();

        cache.publish(snapshot("r2", &[3]));
        assert_eq!(held.revision, "r1");
        assert_eq!(held.instances.len(), 2);
        assert_eq!(cache.get(KEY).unwrap().instances.len(), 1);
    }

    #[test]
    fn test_listeners_called_in_order_on_change_only() {
        let cache = cache();
        let log = Arc::new(Mutex::new(Vec::new()));
        cache.subscribe(KEY, recording_listener(log.clone(), "a"));
        cache.subscribe(KEY, recording_listener(log.clone(), "b"));

        cache.publish(snapshot("r1", &[1]));
        cache.publish(snapshot("r1", &[1]));
        cache.publish(snapshot("r2", &[1, 2]));

        assert_eq!(*log.lock(), vec!["a:r1", "b:r1", "a:r2", "b:r2"]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let cache = cache();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = cache.subscribe(KEY, recording_listener(log.clone(), "a"));
        assert_eq!(cache.subscriber_count(KEY), 1);

        assert!(cache.unsubscribe(KEY, id));
        assert!(!cache.unsubscribe(KEY, id));
        cache.publish(snapshot("r1", &[1]));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_local_health_override() {
        let cache = cache();
        let log = Arc::new(Mutex::new(Vec::new()));
        cache.subscribe(KEY, recording_listener(log.clone(), "a"));
        cache.publish(snapshot("r1", &[1, 2]));

        cache.set_local_health(KEY, "127.0.0.1", 2, HealthStatus::Unhealthy);
        let served = cache.get(KEY).unwrap();
        assert!(served.instances[0].is_healthy());
        assert!(!served.instances[1].is_healthy());
        assert_eq!(served.healthy_only().instances.len(), 1);

        // override survives a refresh with the same server content
        let (served, changed) = cache.publish(snapshot("r1", &[1, 2]));
        assert!(!changed);
        assert!(!served.instances[1].is_healthy());

        cache.set_local_health(KEY, "127.0.0.1", 2, HealthStatus::Healthy);
        assert!(cache.get(KEY).unwrap().instances[1].is_healthy());
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn test_failover_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiscoveryCache::new(
            Duration::from_secs(90),
            Some(FailoverReactor::new(dir.path(), "ns")),
            Arc::new(MetricsMonitor::new().unwrap()),
        );
        cache.publish(snapshot("r1", &[1, 2]));

        let loaded = cache.load_failover("DEFAULT_GROUP", "svc").unwrap();
        assert!(loaded.stale);
        assert_eq!(loaded.revision, "r1");
        assert_eq!(loaded.instances.len(), 2);
        assert!(cache.load_failover("DEFAULT_GROUP", "other").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = DiscoveryCache::new(
            Duration::from_millis(10),
            None,
            Arc::new(MetricsMonitor::new().unwrap()),
        );
        let mut old = snapshot("r1", &[1]);
        old.refreshed_at = Instant::now() - Duration::from_millis(50);
        assert!(cache.is_expired(&old));
        assert!(!cache.is_expired(&snapshot("r1", &[1])));
    }
}
