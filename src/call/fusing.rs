//! Per-key circuit breaker ("fusing").
//!
//! Failures are counted per `node/service/action` key inside a window. When
//! the count reaches the route's threshold the circuit opens and rejects
//! every call for that key until the trip has lasted one full window. There
//! is no half-open probe: once the trip expires the circuit is closed again
//! with a fresh failure window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::spec::{SpecError, WindowSpec};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow; failures are being counted.
    Closed,
    /// Calls are rejected without touching the network.
    Open,
}

#[derive(Debug, Clone, Copy)]
struct Circuit {
    failures: u64,
    window_started: Instant,
    tripped_at: Option<Instant>,
    /// Last policy seen by `inspect`; unknown until the key is first inspected.
    policy: Option<WindowSpec>,
}

impl Circuit {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            window_started: now,
            tripped_at: None,
            policy: None,
        }
    }

    fn restart_window(&mut self, now: Instant) {
        self.failures = 0;
        self.window_started = now;
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_started) >= window {
            self.restart_window(now);
        }
    }

    fn trip(&mut self, now: Instant) {
        self.tripped_at = Some(now);
        self.restart_window(now);
    }

    /// Clears an expired trip. Returns whether the circuit is still open.
    fn still_open(&mut self, now: Instant, window: Duration) -> bool {
        match self.tripped_at {
            Some(at) if now.duration_since(at) < window => true,
            Some(_) => {
                self.tripped_at = None;
                self.restart_window(now);
                false
            }
            None => false,
        }
    }

    fn admit(&mut self, now: Instant, spec: WindowSpec) -> bool {
        self.policy = Some(spec);
        if self.still_open(now, spec.window) {
            return false;
        }
        self.roll_window(now, spec.window);
        if self.failures >= spec.count {
            self.trip(now);
            return false;
        }
        true
    }

    /// Returns `true` when this failure tripped the circuit.
    fn record_failure(&mut self, now: Instant) -> bool {
        let Some(spec) = self.policy else {
            self.failures += 1;
            return false;
        };
        if self.still_open(now, spec.window) {
            return false;
        }
        self.roll_window(now, spec.window);
        self.failures += 1;
        if self.failures >= spec.count {
            self.trip(now);
            return true;
        }
        false
    }
}

/// Process-wide breaker state. Circuits are created on first reference and
/// kept for the lifetime of the breaker.
#[derive(Debug, Default)]
pub struct CircuitBreaker<C = SystemClock> {
    circuits: DashMap<String, Circuit>,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Parses a fusing spec such as `"10/5"` (trip after 5 failures in 10 s,
    /// stay open for 10 s).
    pub fn analyze(spec: &str) -> Result<WindowSpec, SpecError> {
        WindowSpec::parse(spec)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            circuits: DashMap::new(),
            clock,
        }
    }

    /// Whether a call for `key` may proceed under `spec`.
    pub fn inspect(&self, key: &str, spec: WindowSpec) -> bool {
        let now = self.clock.now();
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            return circuit.admit(now, spec);
        }
        self.circuits
            .entry(key.to_owned())
            .or_insert_with(|| Circuit::new(now))
            .admit(now, spec)
    }

    /// Counts one exhausted failure against `key`.
    pub fn add_failure(&self, key: &str) {
        let now = self.clock.now();
        let tripped = self
            .circuits
            .entry(key.to_owned())
            .or_insert_with(|| Circuit::new(now))
            .record_failure(now);
        if tripped {
            warn!(key, "Circuit opened");
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        let now = self.clock.now();
        match self.circuits.get(key) {
            Some(circuit) => match (circuit.tripped_at, circuit.policy) {
                (Some(at), Some(spec)) if now.duration_since(at) < spec.window => {
                    CircuitState::Open
                }
                _ => CircuitState::Closed,
            },
            None => CircuitState::Closed,
        }
    }

    pub fn failures(&self, key: &str) -> u64 {
        self.circuits.get(key).map_or(0, |circuit| circuit.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    const KEY: &str = "10.0.0.1:9000/user/login";

    fn spec(seconds: u64, threshold: u64) -> WindowSpec {
        WindowSpec::new(Duration::from_secs(seconds), threshold)
    }

    #[test]
    fn trips_at_threshold_and_recovers() {
        let clock = MockClock::default();
        let breaker = CircuitBreaker::with_clock(clock.clone());

        breaker.add_failure(KEY);
        breaker.add_failure(KEY);
        assert!(!breaker.inspect(KEY, spec(1, 2)));
        assert_eq!(breaker.state(KEY), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.inspect(KEY, spec(1, 2)));
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert_eq!(breaker.failures(KEY), 0);
    }

    #[test]
    fn analyze_parses_window_and_threshold() {
        assert_eq!(CircuitBreaker::analyze("10/5").unwrap(), spec(10, 5));
        assert!(CircuitBreaker::analyze("10/0").is_err());
    }

    #[test]
    fn known_policy_trips_on_failure() {
        let breaker = CircuitBreaker::with_clock(MockClock::default());

        assert!(breaker.inspect(KEY, spec(10, 2)));
        breaker.add_failure(KEY);
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        breaker.add_failure(KEY);
        assert_eq!(breaker.state(KEY), CircuitState::Open);
        assert!(!breaker.inspect(KEY, spec(10, 2)));
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let clock = MockClock::default();
        let breaker = CircuitBreaker::with_clock(clock.clone());

        assert!(breaker.inspect(KEY, spec(1, 2)));
        breaker.add_failure(KEY);
        clock.advance(Duration::from_millis(1500));
        breaker.add_failure(KEY);

        assert_eq!(breaker.failures(KEY), 1);
        assert!(breaker.inspect(KEY, spec(1, 2)));
    }

    #[test]
    fn stays_open_across_window_boundaries_until_trip_expires() {
        let clock = MockClock::default();
        let breaker = CircuitBreaker::with_clock(clock.clone());

        assert!(breaker.inspect(KEY, spec(2, 1)));
        breaker.add_failure(KEY);

        clock.advance(Duration::from_secs(1));
        assert!(!breaker.inspect(KEY, spec(2, 1)));
        breaker.add_failure(KEY);

        clock.advance(Duration::from_millis(999));
        assert!(!breaker.inspect(KEY, spec(2, 1)));

        clock.advance(Duration::from_millis(1));
        assert!(breaker.inspect(KEY, spec(2, 1)));
    }

    #[test]
    fn unrelated_keys_stay_closed() {
        let breaker = CircuitBreaker::with_clock(MockClock::default());
        breaker.add_failure(KEY);
        breaker.add_failure(KEY);

        assert!(breaker.inspect("10.0.0.2:9000/user/login", spec(1, 2)));
        assert_eq!(breaker.state("never-seen"), CircuitState::Closed);
    }
}
