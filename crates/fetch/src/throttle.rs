//! Per-host adaptive throttle and circuit breaker (§4.7).
//!
//! Exponential backoff on 429/503 (factor 2, 1s initial, 60s ceiling),
//! linear recovery (factor 0.9) on success, honoring `Retry-After` when
//! present. A host that racks up `circuit_breaker_failures` consecutive
//! failures trips the breaker for `circuit_breaker_open_seconds`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const INITIAL_DELAY_MS: u64 = 1000;
const CEILING_MS: u64 = 60_000;
const BACKOFF_FACTOR: f64 = 2.0;
const RECOVERY_FACTOR: f64 = 0.9;

struct HostState {
    delay_ms: f64,
    consecutive_failures: u32,
    breaker_open_until: Option<Instant>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            delay_ms: INITIAL_DELAY_MS as f64,
            consecutive_failures: 0,
            breaker_open_until: None,
        }
    }
}

pub struct Throttle {
    hosts: DashMap<String, HostState>,
    circuit_breaker_failures: u32,
    circuit_breaker_open: Duration,
}

impl Throttle {
    pub fn new(circuit_breaker_failures: u32, circuit_breaker_open_seconds: u64) -> Self {
        Self {
            hosts: DashMap::new(),
            circuit_breaker_failures,
            circuit_breaker_open: Duration::from_secs(circuit_breaker_open_seconds),
        }
    }

    /// Current delay to wait before the next request to `host`.
    pub fn current_delay(&self, host: &str) -> Duration {
        let state = self.hosts.entry(host.to_string()).or_default();
        Duration::from_millis(state.delay_ms as u64)
    }

    /// Whether `host`'s circuit breaker is currently open (requests held).
    pub fn is_open(&self, host: &str) -> bool {
        match self.hosts.get(host) {
            Some(state) => match state.breaker_open_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    /// Records a throttled response (429/503). Applies exponential
    /// backoff, or the server's `Retry-After` if it is larger.
    pub fn record_throttled(&self, host: &str, retry_after: Option<Duration>) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.delay_ms = (state.delay_ms * BACKOFF_FACTOR).min(CEILING_MS as f64);
        if let Some(retry_after) = retry_after {
            state.delay_ms = state.delay_ms.max(retry_after.as_millis() as f64);
        }
        self.record_failure_locked(&mut state);
    }

    /// Records a hard failure (connection error, timeout, 5xx other than
    /// 503) toward the circuit breaker, without touching the delay.
    pub fn record_failure(&self, host: &str) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        self.record_failure_locked(&mut state);
    }

    fn record_failure_locked(&self, state: &mut HostState) {
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.circuit_breaker_failures {
            state.breaker_open_until = Some(Instant::now() + self.circuit_breaker_open);
        }
    }

    /// Records a success: linear recovery of delay, breaker reset.
    pub fn record_success(&self, host: &str) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.delay_ms = (state.delay_ms * RECOVERY_FACTOR).max(INITIAL_DELAY_MS as f64 * RECOVERY_FACTOR);
        state.consecutive_failures = 0;
        state.breaker_open_until = None;
    }
}

/// Snapshot used only for tests; production code goes through `Throttle`.
#[cfg(test)]
pub fn snapshot(throttle: &Throttle) -> HashMap<String, u64> {
    throttle
        .hosts
        .iter()
        .map(|e| (e.key().clone(), e.value().delay_ms as u64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_delay() {
        let t = Throttle::new(5, 300);
        let before = t.current_delay("example.org");
        t.record_throttled("example.org", None);
        let after = t.current_delay("example.org");
        assert!(after > before);
    }

    #[test]
    fn delay_respects_ceiling() {
        let t = Throttle::new(5, 300);
        for _ in 0..20 {
            t.record_throttled("example.org", None);
        }
        assert!(t.current_delay("example.org").as_millis() as u64 <= CEILING_MS);
    }

    #[test]
    fn breaker_trips_after_threshold_failures() {
        let t = Throttle::new(3, 300);
        for _ in 0..3 {
            t.record_failure("example.org");
        }
        assert!(t.is_open("example.org"));
    }

    #[test]
    fn success_resets_breaker() {
        let t = Throttle::new(3, 300);
        for _ in 0..3 {
            t.record_failure("example.org");
        }
        assert!(t.is_open("example.org"));
        t.record_success("example.org");
        assert!(!t.is_open("example.org"));
    }

    #[test]
    fn retry_after_overrides_small_backoff() {
        let t = Throttle::new(5, 300);
        t.record_throttled("example.org", Some(Duration::from_secs(30)));
        assert!(t.current_delay("example.org").as_secs() >= 30);
    }
}
