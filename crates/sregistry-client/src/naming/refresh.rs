//! Background refresh of discovered services
//!
//! One task per service long-polls the instance list with the last known
//! checksum and publishes every answer to the discovery cache, which
//! notifies subscribers when the content changed. A task stops once its
//! service has no subscribers and has not been read for the idle timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use sregistry_api::naming::grouped_name;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::naming::cache::{DiscoveryCache, ServiceSnapshot};
use crate::naming::proxy::NamingProxy;

/// Shortest pause between polls when the server does not hold requests
const MIN_POLL_PAUSE: Duration = Duration::from_secs(1);

struct RefreshTask {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct RefreshContext {
    proxy: NamingProxy,
    cache: Arc<DiscoveryCache>,
    long_poll: Duration,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    idle_timeout: Duration,
    tasks: Arc<DashMap<String, RefreshTask>>,
    last_read: Arc<DashMap<String, Instant>>,
}

/// Owns the per-service refresh tasks
pub struct RefreshWorker {
    ctx: RefreshContext,
    next_generation: AtomicU64,
    root: CancellationToken,
}

impl RefreshWorker {
    pub fn new(
        proxy: NamingProxy,
        cache: Arc<DiscoveryCache>,
        long_poll: Duration,
        retry_backoff: Duration,
        max_retry_backoff: Duration,
        idle_timeout: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            ctx: RefreshContext {
                proxy,
                cache,
                long_poll,
                retry_backoff,
                max_retry_backoff,
                idle_timeout,
                tasks: Arc::new(DashMap::new()),
                last_read: Arc::new(DashMap::new()),
            },
            next_generation: AtomicU64::new(0),
            root,
        }
    }

    /// Fetch the full instance list now and publish it
    pub async fn refresh_now(&self, service_name: &str) -> Result<Arc<ServiceSnapshot>> {
        self.ctx.fetch(service_name, None, None).await
    }

    /// Record a read of the service and start its background task unless
    /// it already runs
    pub fn ensure(&self, service_name: &str) {
        if self.root.is_cancelled() {
            return;
        }
        let key = grouped_name(self.ctx.proxy.group_name(), service_name);
        // touched before the entry lock so a task deciding to stop sees it
        self.ctx.last_read.insert(key.clone(), Instant::now());
        self.ctx.tasks.entry(key).or_insert_with(|| {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let token = self.root.child_token();
            let ctx = self.ctx.clone();
            let service_name = service_name.to_string();
            let task_token = token.clone();
            let handle =
                tokio::spawn(async move { ctx.run(service_name, task_token, generation).await });
            RefreshTask {
                generation,
                token,
                handle,
            }
        });
    }

    pub fn is_running(&self, service_name: &str) -> bool {
        let key = grouped_name(self.ctx.proxy.group_name(), service_name);
        self.ctx.tasks.contains_key(&key)
    }

    pub fn running_count(&self) -> usize {
        self.ctx.tasks.len()
    }

    /// Cancel every task and wait for them to finish
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.ctx.tasks.iter().map(|t| t.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, task)) = self.ctx.tasks.remove(&key) {
                task.token.cancel();
                handles.push(task.handle);
            }
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Refresh task ended abnormally: {}", e);
            }
        }
    }
}

impl RefreshContext {
    async fn fetch(
        &self,
        service_name: &str,
        checksum: Option<&str>,
        wait: Option<Duration>,
    ) -> Result<Arc<ServiceSnapshot>> {
        let info = self
            .proxy
            .query_instances(service_name, checksum, wait)
            .await?;
        let snapshot =
            ServiceSnapshot::from_service_info(self.proxy.group_name(), service_name, info);
        let (served, _) = self.cache.publish(snapshot);
        Ok(served)
    }

    fn read_recently(&self, key: &str) -> bool {
        self.last_read
            .get(key)
            .map(|at| at.elapsed() < self.idle_timeout)
            .unwrap_or(false)
    }

    /// Remove this task's entry if nobody needs the service any more.
    ///
    /// The final read check runs under the entry lock `ensure` takes, so a
    /// concurrent read either keeps this task or starts a new one.
    fn retire_if_idle(&self, key: &str, generation: u64) -> bool {
        if self.cache.subscriber_count(key) > 0 || self.read_recently(key) {
            return false;
        }
        let retired = self
            .tasks
            .remove_if(key, |_, task| {
                task.generation == generation && !self.read_recently(key)
            })
            .is_some();
        if retired {
            self.last_read
                .remove_if(key, |_, at| at.elapsed() >= self.idle_timeout);
        }
        retired
    }

    async fn run(self, service_name: String, token: CancellationToken, generation: u64) {
        let key = grouped_name(self.proxy.group_name(), &service_name);
        info!(service = %key, "Starting service refresh");

        let mut failures = 0u32;
        loop {
            if self.retire_if_idle(&key, generation) {
                debug!(service = %key, "Service idle, stopping refresh");
                break;
            }

            let checksum = self.cache.revision(&key);
            let previous = self.cache.get(&key);
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = self.fetch(&service_name, checksum.as_deref(), Some(self.long_poll)) => r,
            };

            let pause = match result {
                Ok(snapshot) => {
                    failures = 0;
                    let changed = previous
                        .map(|p| p.revision != snapshot.revision || p.instances != snapshot.instances)
                        .unwrap_or(true);
                    next_poll_delay(changed, started.elapsed(), snapshot.cache_millis, self.long_poll)
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let backoff = retry_delay(failures, self.retry_backoff, self.max_retry_backoff);
                    warn!(
                        service = %key,
                        "Failed to refresh service (attempt {}), retrying in {:?}: {}",
                        failures, backoff, e
                    );
                    backoff
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        debug!(service = %key, "Service refresh stopped");
    }
}

/// Pause before the next poll.
///
/// A server that holds long-polls answers unchanged lists only after most of
/// the wait; one that answers early gets polled every `cache_millis`, kept
/// within one second and the long-poll wait.
fn next_poll_delay(changed: bool, elapsed: Duration, cache_millis: u64, long_poll: Duration) -> Duration {
    if changed || elapsed >= long_poll / 2 {
        return Duration::ZERO;
    }
    let floor = MIN_POLL_PAUSE.min(long_poll);
    Duration::from_millis(cache_millis).max(floor).min(long_poll)
}

fn retry_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    base.saturating_mul(factor).min(max).max(Duration::from_millis(1))
}
