//! Load balancer for service discovery
//!
//! Provides weighted random selection from healthy instances.

use rand::Rng;
use sregistry_api::naming::Instance;
use tracing::debug;

use crate::naming::cache::ServiceSnapshot;

/// Load balancer using random weighted selection
pub struct Balancer;

impl Balancer {
    /// Randomly select one available instance, weighted by instance weight.
    ///
    /// Instances that are unhealthy, disabled, or carry a non-positive weight
    /// are never chosen.
    pub fn select_host(snapshot: &ServiceSnapshot) -> Option<Instance> {
        Self::get_host_by_random_weight(&snapshot.instances)
    }

    /// Return one host from list by random weight
    pub fn get_host_by_random_weight(hosts: &[Instance]) -> Option<Instance> {
        let candidates: Vec<&Instance> = hosts
            .iter()
            .filter(|host| host.is_available() && host.weight.is_finite() && host.weight > 0.0)
            .collect();

        if candidates.is_empty() {
            debug!("no available hosts among {}", hosts.len());
            return None;
        }

        let total_weight: f64 = candidates.iter().map(|h| h.weight).sum();
        let mut rng = rand::rng();
        let random = rng.random::<f64>() * total_weight;

        let mut weight_sum = 0.0;
        for host in &candidates {
            weight_sum += host.weight;
            if random < weight_sum {
                return Some((*host).clone());
            }
        }

        // Rounding can leave `random` just above the running sum
        candidates.last().map(|h| (*h).clone())
    }
}
