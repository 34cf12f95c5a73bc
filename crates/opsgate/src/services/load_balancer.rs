//! Load balancing across healthy service instances.
//!
//! The balancer picks from the healthy slice the caller snapshots from
//! the registry, so a shrinking instance set between picks can never
//! index out of range. Every pick returns an RAII guard that tracks the
//! in-flight count for the chosen instance and decrements on drop, which
//! covers success, error, and cancellation paths alike.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::models::instance::ServiceInstance;
use crate::models::route::LoadBalanceStrategy;

/// Decrements the chosen instance's in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-service round-robin cursors plus per-instance in-flight counters.
pub struct LoadBalancer {
    rr_counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
    in_flight: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            rr_counters: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    fn rr_counter(&self, service_name: &str) -> Arc<AtomicUsize> {
        {
            let counters = self.rr_counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get(service_name) {
                return counter.clone();
            }
        }
        self.rr_counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn in_flight_counter(&self, instance_key: &str) -> Arc<AtomicU64> {
        {
            let counters = self.in_flight.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get(instance_key) {
                return counter.clone();
            }
        }
        self.in_flight
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(instance_key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Current in-flight count for an instance, exposed for metrics.
    pub fn in_flight_of(&self, instance: &ServiceInstance) -> u64 {
        self.in_flight_counter(&instance.id).load(Ordering::Acquire)
    }

    /// Picks one instance from `healthy` under the route's strategy.
    /// Returns `None` when the slice is empty or no instance is eligible.
    pub fn pick(
        &self,
        service_name: &str,
        strategy: LoadBalanceStrategy,
        healthy: &[ServiceInstance],
    ) -> Option<(ServiceInstance, InFlightGuard)> {
        if healthy.is_empty() {
            return None;
        }

        let chosen = match strategy {
            LoadBalanceStrategy::RoundRobin => self.pick_round_robin(service_name, healthy),
            LoadBalanceStrategy::Weighted => pick_weighted(healthy),
            LoadBalanceStrategy::LeastConnections => {
                self.pick_least_connections(service_name, healthy)
            }
        }?;

        let counter = self.in_flight_counter(&chosen.id);
        counter.fetch_add(1, Ordering::AcqRel);
        Some((chosen.clone(), InFlightGuard { counter }))
    }

    fn pick_round_robin<'a>(
        &self,
        service_name: &str,
        healthy: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let index = self.rr_counter(service_name).fetch_add(1, Ordering::Relaxed);
        healthy.get(index % healthy.len())
    }

    fn pick_least_connections<'a>(
        &self,
        service_name: &str,
        healthy: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let min_count = healthy
            .iter()
            .map(|i| self.in_flight_counter(&i.id).load(Ordering::Acquire))
            .min()?;
        let tied: Vec<&ServiceInstance> = healthy
            .iter()
            .filter(|i| self.in_flight_counter(&i.id).load(Ordering::Acquire) == min_count)
            .collect();

        let max_weight = tied.iter().map(|i| i.weight).max()?;
        let finalists: Vec<&ServiceInstance> =
            tied.into_iter().filter(|i| i.weight == max_weight).collect();

        // Remaining ties rotate round-robin so equal instances share load.
        let index = self.rr_counter(service_name).fetch_add(1, Ordering::Relaxed);
        finalists.get(index % finalists.len()).copied()
    }
}

/// Cumulative-weight sampling; zero-weight instances are ineligible.
fn pick_weighted(healthy: &[ServiceInstance]) -> Option<&ServiceInstance> {
    let total: u64 = healthy.iter().map(|i| i.weight as u64).sum();
    if total == 0 {
        return None;
    }
    let mut point = rand::thread_rng().gen_range(0..total);
    for instance in healthy {
        let weight = instance.weight as u64;
        if point < weight {
            return Some(instance);
        }
        point -= weight;
    }
    None
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::{InstanceStatus, Protocol};
    use crate::models::route::RecordStatus;
    use chrono::Utc;

    fn instance(id: &str, weight: u32) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service_name: "orders".to_string(),
            instance_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            protocol: Protocol::Http,
            weight,
            instance_status: InstanceStatus::Healthy,
            last_health_check: None,
            health_check_url: None,
            health_check_interval_seconds: 30,
            metadata: None,
            registered_at: Utc::now(),
            status: RecordStatus::Active,
            updated_at: None,
        }
    }

    #[test]
    fn round_robin_cycles_through_instances() {
        let lb = LoadBalancer::new();
        let healthy = vec![instance("a", 1), instance("b", 1), instance("c", 1)];

        let picks: Vec<String> = (0..6)
            .map(|_| {
                let (chosen, _guard) = lb
                    .pick("orders", LoadBalanceStrategy::RoundRobin, &healthy)
                    .unwrap();
                chosen.id
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_tolerates_a_shrinking_healthy_set() {
        let lb = LoadBalancer::new();
        let full = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
        for _ in 0..5 {
            lb.pick("orders", LoadBalanceStrategy::RoundRobin, &full);
        }
        // Counter is far beyond the new length; the pick must still land.
        let shrunk = vec![instance("a", 1)];
        let (chosen, _guard) = lb
            .pick("orders", LoadBalanceStrategy::RoundRobin, &shrunk)
            .unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn weighted_never_selects_zero_weight() {
        let healthy = vec![instance("a", 0), instance("b", 5)];
        for _ in 0..50 {
            assert_eq!(pick_weighted(&healthy).unwrap().id, "b");
        }
        let all_zero = vec![instance("a", 0)];
        assert!(pick_weighted(&all_zero).is_none());
    }

    #[test]
    fn weighted_distribution_tracks_weights() {
        let healthy = vec![instance("a", 9), instance("b", 1)];
        let mut hits_a = 0;
        for _ in 0..1000 {
            if pick_weighted(&healthy).unwrap().id == "a" {
                hits_a += 1;
            }
        }
        // Expect roughly 90%; allow a generous band.
        assert!(hits_a > 780, "got {hits_a}");
    }

    #[test]
    fn least_connections_balances_within_one() {
        let lb = LoadBalancer::new();
        let healthy = vec![instance("a", 1), instance("b", 1), instance("c", 1)];

        let guards: Vec<_> = (0..9)
            .map(|_| {
                lb.pick("orders", LoadBalanceStrategy::LeastConnections, &healthy)
                    .unwrap()
            })
            .collect();

        let counts: Vec<u64> = healthy.iter().map(|i| lb.in_flight_of(i)).collect();
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "counts {counts:?}");
        drop(guards);
        assert!(healthy.iter().all(|i| lb.in_flight_of(i) == 0));
    }

    #[test]
    fn guard_releases_on_drop() {
        let lb = LoadBalancer::new();
        let healthy = vec![instance("a", 1)];

        {
            let (_chosen, _guard) = lb
                .pick("orders", LoadBalanceStrategy::LeastConnections, &healthy)
                .unwrap();
            assert_eq!(lb.in_flight_of(&healthy[0]), 1);
        }
        assert_eq!(lb.in_flight_of(&healthy[0]), 0);
    }

    #[test]
    fn least_connections_prefers_idle_then_weight() {
        let lb = LoadBalancer::new();
        let healthy = vec![instance("a", 1), instance("b", 3)];

        // Occupy "b" so "a" is the idle one despite its lower weight.
        let (first, _guard) = lb
            .pick("orders", LoadBalanceStrategy::LeastConnections, &healthy)
            .unwrap();
        assert_eq!(first.id, "b", "weight breaks the initial tie");

        let (second, _guard2) = lb
            .pick("orders", LoadBalanceStrategy::LeastConnections, &healthy)
            .unwrap();
        assert_eq!(second.id, "a");
    }
}
