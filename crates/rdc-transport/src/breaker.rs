//! Per-destination circuit breakers.
//!
//! A destination is callable iff `now >= open_until`. Reaching the failure
//! threshold opens the circuit for the cooldown; once the cooldown has elapsed the
//! circuit is closed again with a fresh counter. A single success resets the
//! counter unconditionally.
//!
//! With `half_open_probe` enabled, cooldown expiry admits exactly one probe call
//! and rejects everyone else until that probe reports back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_probe: bool,
    pub probe_jitter: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
            half_open_probe: false,
            probe_jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    total_trips: u64,
    probe_started: Option<Instant>,
}

impl CircuitState {
    fn close(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
        self.probe_started = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub destination: String,
    pub consecutive_failures: u32,
    pub open: bool,
    pub remaining_cooldown_ms: u64,
    pub total_trips: u64,
    pub probing: bool,
}

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitState>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    async fn existing(&self, destination: &str) -> Option<Arc<Mutex<CircuitState>>> {
        self.circuits.read().await.get(destination).cloned()
    }

    async fn circuit(&self, destination: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(circuit) = self.existing(destination).await {
            return circuit;
        }
        let mut map = self.circuits.write().await;
        map.entry(destination.to_string()).or_default().clone()
    }

    fn cooldown_with_jitter(&self) -> Duration {
        let jitter_ms = self.config.probe_jitter.as_millis() as u64;
        if !self.config.half_open_probe || jitter_ms == 0 {
            return self.config.cooldown;
        }
        self.config.cooldown + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    fn trip(&self, destination: &str, state: &mut CircuitState, now: Instant) {
        let cooldown = self.cooldown_with_jitter();
        state.open_until = Some(now + cooldown);
        state.probe_started = None;
        state.total_trips += 1;
        warn!(
            event = "circuit_opened",
            destination,
            failures = state.consecutive_failures,
            cooldown_ms = cooldown.as_millis() as u64,
            "circuit opened"
        );
    }

    pub async fn can_call(&self, destination: &str) -> bool {
        let Some(circuit) = self.existing(destination).await else {
            return true;
        };
        let mut state = circuit.lock().await;
        let now = Instant::now();

        let Some(open_until) = state.open_until else {
            return true;
        };
        if now < open_until {
            return false;
        }

        if !self.config.half_open_probe {
            state.close();
            info!(event = "circuit_closed", destination, "cooldown elapsed");
            return true;
        }

        // A probe that never reported back releases its claim after one cooldown.
        match state.probe_started {
            Some(started) if now < started + self.config.cooldown => false,
            _ => {
                state.probe_started = Some(now);
                info!(event = "circuit_probe", destination, "admitting single probe");
                true
            }
        }
    }

    pub async fn record_success(&self, destination: &str) {
        let Some(circuit) = self.existing(destination).await else {
            return;
        };
        let mut state = circuit.lock().await;
        if state.open_until.is_some() || state.consecutive_failures > 0 {
            info!(event = "circuit_reset", destination, "success reset failure counter");
        }
        state.close();
    }

    /// Returns true when this failure opened (or reopened) the circuit.
    pub async fn record_failure(&self, destination: &str) -> bool {
        let circuit = self.circuit(destination).await;
        let mut state = circuit.lock().await;
        let now = Instant::now();

        if state.probe_started.is_some() {
            state.consecutive_failures += 1;
            self.trip(destination, &mut state, now);
            return true;
        }

        match state.open_until {
            Some(until) if now < until => {
                state.consecutive_failures += 1;
                return false;
            }
            Some(_) if !self.config.half_open_probe => state.close(),
            _ => {}
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
            self.trip(destination, &mut state, now);
            return true;
        }
        false
    }

    pub async fn consecutive_failures(&self, destination: &str) -> u32 {
        match self.existing(destination).await {
            Some(circuit) => circuit.lock().await.consecutive_failures,
            None => 0,
        }
    }

    /// Manually close a circuit. Returns false when the destination has no state yet.
    pub async fn reset(&self, destination: &str) -> bool {
        let Some(circuit) = self.existing(destination).await else {
            return false;
        };
        circuit.lock().await.close();
        info!(event = "circuit_manual_reset", destination, "circuit reset");
        true
    }

    pub async fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits: Vec<(String, Arc<Mutex<CircuitState>>)> = self
            .circuits
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let now = Instant::now();
        let mut out = Vec::with_capacity(circuits.len());
        for (destination, circuit) in circuits {
            let state = circuit.lock().await;
            let remaining = state
                .open_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default();
            out.push(CircuitSnapshot {
                destination,
                consecutive_failures: state.consecutive_failures,
                open: !remaining.is_zero(),
                remaining_cooldown_ms: remaining.as_millis() as u64,
                total_trips: state.total_trips,
                probing: state.probe_started.is_some(),
            });
        }
        out.sort_by(|a, b| a.destination.cmp(&b.destination));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn registry(threshold: u32, cooldown_secs: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            ..BreakerConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_closes_after_cooldown() {
        let breakers = registry(3, 60);
        assert!(!breakers.record_failure("email").await);
        assert!(!breakers.record_failure("email").await);
        assert!(breakers.can_call("email").await);
        assert!(breakers.record_failure("email").await);
        assert!(!breakers.can_call("email").await);

        advance(Duration::from_secs(59)).await;
        assert!(!breakers.can_call("email").await);

        advance(Duration::from_secs(1)).await;
        assert!(breakers.can_call("email").await);
        assert_eq!(breakers.consecutive_failures("email").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_before_threshold_resets_counter() {
        let breakers = registry(3, 60);
        breakers.record_failure("sms").await;
        breakers.record_failure("sms").await;
        breakers.record_success("sms").await;
        assert_eq!(breakers.consecutive_failures("sms").await, 0);

        breakers.record_failure("sms").await;
        breakers.record_failure("sms").await;
        assert!(breakers.can_call("sms").await);
    }

    #[tokio::test(start_paused = true)]
    async fn destinations_are_isolated() {
        let breakers = registry(1, 60);
        breakers.record_failure("platform:reddit").await;
        assert!(!breakers.can_call("platform:reddit").await);
        assert!(breakers.can_call("email").await);
    }

    #[tokio::test(start_paused = true)]
    async fn single_success_rearms_an_open_circuit() {
        let breakers = registry(2, 60);
        breakers.record_failure("email").await;
        breakers.record_failure("email").await;
        assert!(!breakers.can_call("email").await);
        breakers.record_success("email").await;
        assert!(breakers.can_call("email").await);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_mode_admits_one_caller_after_cooldown() {
        let breakers = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
            half_open_probe: true,
            probe_jitter: Duration::ZERO,
        });
        breakers.record_failure("sms").await;
        advance(Duration::from_secs(10)).await;

        assert!(breakers.can_call("sms").await);
        assert!(!breakers.can_call("sms").await);

        assert!(breakers.record_failure("sms").await);
        assert!(!breakers.can_call("sms").await);

        advance(Duration::from_secs(10)).await;
        assert!(breakers.can_call("sms").await);
        breakers.record_success("sms").await;
        assert!(breakers.can_call("sms").await);
        assert!(breakers.can_call("sms").await);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_and_manual_reset() {
        let breakers = registry(1, 30);
        assert!(!breakers.reset("email").await);
        breakers.record_failure("email").await;

        let snap = breakers.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(snap[0].open);
        assert_eq!(snap[0].total_trips, 1);
        assert_eq!(snap[0].remaining_cooldown_ms, 30_000);

        assert!(breakers.reset("email").await);
        assert!(breakers.can_call("email").await);
        assert_eq!(breakers.snapshot().await[0].total_trips, 1);
    }
}
