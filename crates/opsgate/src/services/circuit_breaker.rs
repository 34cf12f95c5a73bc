//! Per-service circuit breakers.
//!
//! Each upstream service gets a three-state guard: `closed` counts
//! consecutive failures and opens at the configured threshold; `open`
//! rejects requests until wall clock reaches `next_attempt_time`; the
//! first arrival after that instant is admitted as the single half-open
//! probe whose outcome either closes or reopens the circuit.
//!
//! Hot-path checks are pure atomics. Probe admission is a compare-and-
//! swap on a dedicated flag, so concurrent arrivals at the reopen
//! instant elect exactly one probe and the rest fail fast. Every state
//! transition is mirrored into the route store for operators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{TimeZone, Utc};
use log::{info, warn};

use crate::models::circuit::{CircuitBreakerRecord, CircuitState};
use crate::models::error::GatewayError;
use crate::store::RouteStore;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before admitting a probe.
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60,
        }
    }
}

/// What kind of admission a request received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    /// Circuit closed, regular request.
    Normal,
    /// The single half-open probe.
    Probe,
}

/// Admission token. The holder must report the outcome exactly once via
/// `record_success`, `record_failure`, or `release_cancelled_sync`.
#[derive(Debug, Clone)]
pub struct BreakerPermit {
    pub service_name: String,
    pub kind: PermitKind,
}

fn state_from_u8(value: u8) -> CircuitState {
    match value {
        1 => CircuitState::Open,
        2 => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

struct ServiceBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_ms: AtomicI64,
    next_attempt_ms: AtomicI64,
    probe_in_flight: AtomicBool,
}

impl ServiceBreaker {
    fn new(service_name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            service_name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(0),
            next_attempt_ms: AtomicI64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    fn current_state(&self) -> CircuitState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Admission decision. Returns the permit kind, or `None` when the
    /// request must be rejected with `circuit_open`.
    fn try_acquire(&self, now_ms: i64) -> Option<PermitKind> {
        match self.current_state() {
            CircuitState::Closed => Some(PermitKind::Normal),
            CircuitState::Open => {
                if now_ms < self.next_attempt_ms.load(Ordering::Acquire) {
                    return None;
                }
                // One winner becomes the probe; everyone else stays shut
                // out until the probe reports back.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    info!(
                        "Circuit breaker {} half-open, admitting probe",
                        self.service_name
                    );
                    Some(PermitKind::Probe)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => None,
        }
    }

    /// Returns true when the call changed the persisted state.
    fn on_success(&self, kind: PermitKind) -> bool {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            PermitKind::Normal => {
                self.failure_count.store(0, Ordering::Relaxed);
                false
            }
            PermitKind::Probe => {
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                self.failure_count.store(0, Ordering::Relaxed);
                self.probe_in_flight.store(false, Ordering::Release);
                info!(
                    "Circuit breaker {} closed, service recovered",
                    self.service_name
                );
                true
            }
        }
    }

    fn on_failure(&self, kind: PermitKind, now_ms: i64) -> bool {
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        match kind {
            PermitKind::Normal => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self.current_state() == CircuitState::Closed
                {
                    self.trip(now_ms);
                    true
                } else {
                    false
                }
            }
            PermitKind::Probe => {
                self.trip(now_ms);
                self.probe_in_flight.store(false, Ordering::Release);
                true
            }
        }
    }

    /// A cancelled request reports neither success nor failure; a probe
    /// permit is handed back so the next arrival can probe again.
    fn on_cancel(&self, kind: PermitKind) {
        if kind == PermitKind::Probe {
            self.state.store(CircuitState::Open as u8, Ordering::Release);
            self.next_attempt_ms
                .store(Utc::now().timestamp_millis(), Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn trip(&self, now_ms: i64) {
        self.next_attempt_ms.store(
            now_ms + (self.config.timeout_seconds as i64) * 1000,
            Ordering::Release,
        );
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Relaxed);
        warn!(
            "Circuit breaker {} opened after {} consecutive failures",
            self.service_name,
            self.failure_count.load(Ordering::Relaxed)
        );
    }

    fn record(&self) -> CircuitBreakerRecord {
        let ms_to_time = |ms: i64| {
            (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms).single())
                .flatten()
        };
        CircuitBreakerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: self.service_name.clone(),
            state: self.current_state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            last_failure_time: ms_to_time(self.last_failure_ms.load(Ordering::Relaxed)),
            next_attempt_time: ms_to_time(self.next_attempt_ms.load(Ordering::Relaxed)),
            failure_threshold: self.config.failure_threshold,
            timeout_seconds: self.config.timeout_seconds,
            updated_at: Utc::now(),
        }
    }
}

/// One breaker per upstream service, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<ServiceBreaker>>>,
    config: CircuitBreakerConfig,
    store: Arc<RouteStore>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, store: Arc<RouteStore>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            store,
        }
    }

    fn breaker(&self, service_name: &str) -> Arc<ServiceBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(breaker) = breakers.get(service_name) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceBreaker::new(service_name.to_string(), self.config))
            })
            .clone()
    }

    /// Gate step of the pipeline.
    pub async fn check(&self, service_name: &str) -> Result<BreakerPermit, GatewayError> {
        let breaker = self.breaker(service_name);
        let now_ms = Utc::now().timestamp_millis();
        match breaker.try_acquire(now_ms) {
            Some(kind) => {
                if kind == PermitKind::Probe {
                    self.mirror(&breaker).await;
                }
                Ok(BreakerPermit {
                    service_name: service_name.to_string(),
                    kind,
                })
            }
            None => Err(GatewayError::CircuitOpen {
                service: service_name.to_string(),
            }),
        }
    }

    pub async fn record_success(&self, permit: &BreakerPermit) {
        let breaker = self.breaker(&permit.service_name);
        if breaker.on_success(permit.kind) {
            self.mirror(&breaker).await;
        }
    }

    pub async fn record_failure(&self, permit: &BreakerPermit) {
        let breaker = self.breaker(&permit.service_name);
        if breaker.on_failure(permit.kind, Utc::now().timestamp_millis()) {
            self.mirror(&breaker).await;
        }
    }

    /// Cancellations do not count as upstream failures. Sync so it can
    /// run from drop glue when a client disconnects mid-request.
    pub fn release_cancelled_sync(&self, permit: &BreakerPermit) {
        let breaker = self.breaker(&permit.service_name);
        breaker.on_cancel(permit.kind);
    }

    pub fn state_of(&self, service_name: &str) -> CircuitState {
        self.breaker(service_name).current_state()
    }

    async fn mirror(&self, breaker: &ServiceBreaker) {
        if let Err(e) = self.store.save_circuit(breaker.record()).await {
            warn!(
                "Failed to mirror circuit state for {}: {e}",
                breaker.service_name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_seconds: u64) -> ServiceBreaker {
        ServiceBreaker::new(
            "orders".to_string(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout_seconds,
            },
        )
    }

    #[test]
    fn opens_exactly_at_the_failure_threshold() {
        let b = breaker(3, 60);
        let now = 1_000_000;

        for _ in 0..2 {
            let kind = b.try_acquire(now).unwrap();
            b.on_failure(kind, now);
            assert_eq!(b.current_state(), CircuitState::Closed);
        }

        let kind = b.try_acquire(now).unwrap();
        b.on_failure(kind, now);
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(b.try_acquire(now + 1).is_none());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let b = breaker(3, 60);
        let now = 1_000_000;

        for _ in 0..2 {
            let kind = b.try_acquire(now).unwrap();
            b.on_failure(kind, now);
        }
        let kind = b.try_acquire(now).unwrap();
        b.on_success(kind);

        // Two more failures are again below the threshold.
        for _ in 0..2 {
            let kind = b.try_acquire(now).unwrap();
            b.on_failure(kind, now);
        }
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[test]
    fn admits_a_single_probe_after_the_timeout() {
        let b = breaker(1, 60);
        let now = 1_000_000;

        let kind = b.try_acquire(now).unwrap();
        b.on_failure(kind, now);
        assert_eq!(b.current_state(), CircuitState::Open);

        let after_timeout = now + 61_000;
        let first = b.try_acquire(after_timeout);
        assert_eq!(first, Some(PermitKind::Probe));
        // Concurrent arrivals while the probe is outstanding are shut out.
        assert!(b.try_acquire(after_timeout + 1).is_none());
        assert!(b.try_acquire(after_timeout + 2).is_none());
    }

    #[test]
    fn probe_success_closes_and_probe_failure_reopens() {
        let b = breaker(1, 60);
        let now = 1_000_000;

        let kind = b.try_acquire(now).unwrap();
        b.on_failure(kind, now);

        let probe_at = now + 61_000;
        let probe = b.try_acquire(probe_at).unwrap();
        assert_eq!(probe, PermitKind::Probe);
        b.on_success(probe);
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert_eq!(b.failure_count.load(Ordering::Relaxed), 0);

        // Trip again, then fail the probe.
        let kind = b.try_acquire(probe_at).unwrap();
        b.on_failure(kind, probe_at);
        let probe = b.try_acquire(probe_at + 61_000).unwrap();
        b.on_failure(probe, probe_at + 61_000);
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(b.try_acquire(probe_at + 61_001).is_none());
    }

    #[test]
    fn cancelled_probe_hands_back_the_slot() {
        let b = breaker(1, 60);
        let now = 1_000_000;

        let kind = b.try_acquire(now).unwrap();
        b.on_failure(kind, now);

        let probe_at = now + 61_000;
        let probe = b.try_acquire(probe_at).unwrap();
        assert_eq!(probe, PermitKind::Probe);
        b.on_cancel(probe);

        // The next arrival becomes the probe instead of being rejected
        // until the timeout elapses again.
        let retry = b.try_acquire(probe_at + 10);
        assert_eq!(retry, Some(PermitKind::Probe));
    }

    #[tokio::test]
    async fn registry_mirrors_transitions_into_the_store() {
        let store = Arc::new(RouteStore::in_memory());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_seconds: 60,
            },
            store.clone(),
        );

        let permit = registry.check("orders").await.unwrap();
        registry.record_failure(&permit).await;

        let record = store.get_circuit("orders").await.unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert!(record.next_attempt_time.is_some());

        let err = registry.check("orders").await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }
}
