//! Naming event listener trait and event types

use std::fmt;

use sregistry_api::naming::{HealthStatus, Instance};

/// Event delivered to naming listeners when a service's instance list changes.
#[derive(Clone, Debug)]
pub struct NamingEvent {
    pub service_name: String,
    pub group_name: String,
    /// Server checksum of the new snapshot
    pub revision: String,
    pub instances: Vec<Instance>,
}

/// Trait for receiving naming service change events.
///
/// Implement this to be notified when a subscribed service's instance list changes.
/// Callbacks run on the task that detected the change and must not subscribe
/// to or unsubscribe from the same service.
pub trait EventListener: Send + Sync + 'static {
    /// Called when the service's instance list has changed.
    fn on_event(&self, event: NamingEvent);
}

/// A simple listener that invokes a closure.
pub struct FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventListener for FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: NamingEvent) {
        (self.f)(event);
    }
}

/// Handle returned by `subscribe`, needed to unsubscribe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Local health transition of a registered instance, decided by the
/// heartbeat scheduler
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceHealthEvent {
    pub service_name: String,
    pub group_name: String,
    pub ip: String,
    pub port: u16,
    pub status: HealthStatus,
    /// Consecutive missed beats when the event was raised
    pub missed_beats: u32,
    pub timestamp: i64,
}

impl InstanceHealthEvent {
    pub fn new(
        service_name: &str,
        group_name: &str,
        ip: &str,
        port: u16,
        status: HealthStatus,
        missed_beats: u32,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            ip: ip.to_string(),
            port,
            status,
            missed_beats,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_fn_event_listener() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let listener = FnEventListener::new(move |event: NamingEvent| {
            assert_eq!(event.service_name, "my-service");
            assert_eq!(event.instances.len(), 1);
            called_clone.store(true, Ordering::SeqCst);
        });

        listener.on_event(NamingEvent {
            service_name: "my-service".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            revision: "abc".to_string(),
            instances: vec![Instance::new("127.0.0.1", 8080)],
        });

        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub-7");
        assert!(SubscriptionId(1) < SubscriptionId(2));
    }
}
