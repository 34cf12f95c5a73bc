//! Service registry and the health-check loop.
//!
//! The registry fronts the store for instance lifecycle operations and
//! runs a single scheduler task that probes each instance at its
//! declared interval with bounded concurrency. State changes use
//! hysteresis: an instance turns `unhealthy` only after the configured
//! number of consecutive probe failures, and returns to `healthy` after
//! a single success. Draining instances are left alone; draining is an
//! operator decision, not a health verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::models::error::GatewayError;
use crate::models::instance::{
    BatchInstanceRegisterRequest, InstanceRegisterRequest, InstanceStatus, ServiceInstance,
};
use crate::store::RouteStore;

/// Concurrent in-flight health probes per sweep.
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Scheduler tick; individual instances honor their own interval.
    pub base_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before an instance is marked unhealthy.
    pub unhealthy_threshold: u32,
}

pub struct ServiceRegistry {
    store: Arc<RouteStore>,
    client: reqwest::Client,
    config: HealthCheckConfig,
    /// Consecutive probe failures per instance id.
    failures: Mutex<HashMap<String, u32>>,
    /// Next probe deadline per instance id.
    next_due: Mutex<HashMap<String, Instant>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<RouteStore>, config: HealthCheckConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            client,
            config,
            failures: Mutex::new(HashMap::new()),
            next_due: Mutex::new(HashMap::new()),
        }
    }

    // Lifecycle operations delegate to the store, which owns the rows.

    pub async fn register(
        &self,
        req: InstanceRegisterRequest,
    ) -> Result<ServiceInstance, GatewayError> {
        let instance = self.store.register_instance(req).await?;
        info!(
            "Registered instance {} for service {} at {}",
            instance.instance_id,
            instance.service_name,
            instance.base_url()
        );
        Ok(instance)
    }

    pub async fn register_batch(
        &self,
        req: BatchInstanceRegisterRequest,
    ) -> Result<Vec<ServiceInstance>, GatewayError> {
        req.validate()
            .map_err(|message| GatewayError::Validation { message })?;
        let mut registered = Vec::with_capacity(req.instances.len());
        for instance in req.instances {
            registered.push(self.register(instance).await?);
        }
        Ok(registered)
    }

    pub async fn deregister(&self, id: &str) -> Result<(), GatewayError> {
        self.store.deregister_instance(id).await?;
        self.failures.lock().await.remove(id);
        self.next_due.lock().await.remove(id);
        Ok(())
    }

    pub async fn drain(&self, id: &str) -> Result<(), GatewayError> {
        self.store.drain_instance(id).await
    }

    pub async fn list_healthy(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.store.healthy_instances(service_name).await
    }

    /// Spawns the health loop. A single task visits due instances every
    /// tick, with at most [`SWEEP_CONCURRENCY`] probes in flight.
    pub fn spawn_health_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.base_interval.min(
                Duration::from_secs(5),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One pass over all registered instances; public for tests.
    pub async fn sweep_once(&self) {
        let instances = self.store.list_instances(None).await;
        let now = Instant::now();

        let mut due = Vec::new();
        {
            let mut next_due = self.next_due.lock().await;
            for instance in instances {
                if instance.instance_status == InstanceStatus::Draining {
                    continue;
                }
                let deadline = next_due.entry(instance.id.clone()).or_insert(now);
                if *deadline <= now {
                    *deadline =
                        now + Duration::from_secs(instance.health_check_interval_seconds);
                    due.push(instance);
                }
            }
        }

        if due.is_empty() {
            return;
        }

        let results: Vec<(ServiceInstance, bool)> = stream::iter(due)
            .map(|instance| {
                let client = self.client.clone();
                async move {
                    let ok = probe(&client, &instance).await;
                    (instance, ok)
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for (instance, ok) in results {
            self.apply_probe_result(&instance, ok).await;
        }
    }

    async fn apply_probe_result(&self, instance: &ServiceInstance, ok: bool) {
        let mut failures = self.failures.lock().await;
        if ok {
            failures.remove(&instance.id);
            // One success is enough to recover.
            if instance.instance_status == InstanceStatus::Unhealthy {
                if let Ok(previous) = self
                    .store
                    .set_instance_health(&instance.id, InstanceStatus::Healthy)
                    .await
                {
                    info!(
                        "Instance {}/{} recovered ({} -> healthy)",
                        instance.service_name,
                        instance.instance_id,
                        status_str(previous)
                    );
                }
            } else {
                let _ = self
                    .store
                    .set_instance_health(&instance.id, InstanceStatus::Healthy)
                    .await;
            }
        } else {
            let count = failures.entry(instance.id.clone()).or_insert(0);
            *count += 1;
            debug!(
                "Health probe failed for {}/{} ({}/{})",
                instance.service_name, instance.instance_id, count, self.config.unhealthy_threshold
            );
            if *count >= self.config.unhealthy_threshold
                && instance.instance_status == InstanceStatus::Healthy
            {
                if let Ok(previous) = self
                    .store
                    .set_instance_health(&instance.id, InstanceStatus::Unhealthy)
                    .await
                {
                    warn!(
                        "Instance {}/{} marked unhealthy after {} consecutive failures ({} -> unhealthy)",
                        instance.service_name,
                        instance.instance_id,
                        count,
                        status_str(previous)
                    );
                }
            }
        }
    }
}

fn status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Healthy => "healthy",
        InstanceStatus::Unhealthy => "unhealthy",
        InstanceStatus::Draining => "draining",
    }
}

/// Issues one GET against the instance's health URL. Instances without
/// a health URL are assumed healthy.
async fn probe(client: &reqwest::Client, instance: &ServiceInstance) -> bool {
    let Some(url) = &instance.health_check_url else {
        return true;
    };
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.clone()
    } else {
        format!("{}{}", instance.base_url(), url)
    };
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(store: Arc<RouteStore>, threshold: u32) -> ServiceRegistry {
        ServiceRegistry::new(
            store,
            HealthCheckConfig {
                base_interval: Duration::from_secs(30),
                probe_timeout: Duration::from_millis(200),
                unhealthy_threshold: threshold,
            },
        )
    }

    fn register_req(service: &str, id: &str, health_url: Option<&str>) -> InstanceRegisterRequest {
        serde_json::from_value(json!({
            "service_name": service,
            "instance_id": id,
            // Reserved TEST-NET-1 address, nothing listens there.
            "host": "192.0.2.1",
            "port": 9,
            "health_check_url": health_url,
            "health_check_interval_seconds": 5
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn instances_without_health_url_stay_healthy() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = registry(store.clone(), 1);
        registry
            .register(register_req("orders", "o-1", None))
            .await
            .unwrap();

        registry.sweep_once().await;
        assert_eq!(registry.list_healthy("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn hysteresis_requires_consecutive_failures() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = registry(store.clone(), 3);
        let instance = registry
            .register(register_req("orders", "o-1", Some("/health")))
            .await
            .unwrap();

        // First two failing probes keep the instance healthy.
        for _ in 0..2 {
            registry.apply_probe_result(&instance, false).await;
            assert_eq!(registry.list_healthy("orders").await.len(), 1);
        }

        registry.apply_probe_result(&instance, false).await;
        assert!(registry.list_healthy("orders").await.is_empty());
    }

    #[tokio::test]
    async fn one_success_recovers_an_unhealthy_instance() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = registry(store.clone(), 1);
        let instance = registry
            .register(register_req("orders", "o-1", Some("/health")))
            .await
            .unwrap();

        registry.apply_probe_result(&instance, false).await;
        assert!(registry.list_healthy("orders").await.is_empty());

        let unhealthy = store.list_instances(Some("orders")).await.remove(0);
        registry.apply_probe_result(&unhealthy, true).await;
        assert_eq!(registry.list_healthy("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn draining_instances_are_not_probed() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = registry(store.clone(), 1);
        let instance = registry
            .register(register_req("orders", "o-1", Some("/health")))
            .await
            .unwrap();
        registry.drain(&instance.id).await.unwrap();

        // The sweep must skip the draining instance entirely; its state
        // stays draining rather than flipping to unhealthy.
        registry.sweep_once().await;
        let after = store.list_instances(Some("orders")).await.remove(0);
        assert_eq!(after.instance_status, InstanceStatus::Draining);
    }

    #[tokio::test]
    async fn deregistered_instances_leave_the_pool() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = registry(store.clone(), 1);
        let instance = registry
            .register(register_req("orders", "o-1", None))
            .await
            .unwrap();
        assert_eq!(registry.list_healthy("orders").await.len(), 1);

        registry.deregister(&instance.id).await.unwrap();
        assert!(registry.list_healthy("orders").await.is_empty());
    }
}
