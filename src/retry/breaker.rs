//! Named circuit breakers.
//!
//! Each name tracks consecutive failures. At the threshold the circuit
//! opens and calls fail fast; once the reset timeout elapses the circuit
//! half-opens and the next outcome decides between closed and open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    failures: usize,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl Circuit {
    fn new() -> Circuit {
        Circuit {
            failures: 0,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }
}

#[derive(Clone)]
pub struct Breaker {
    circuits: Arc<Mutex<HashMap<String, Circuit>>>,
    threshold: usize,
    reset_timeout: Duration,
}

impl Breaker {
    pub fn new(threshold: usize, reset_timeout: Duration) -> Breaker {
        Breaker {
            circuits: Arc::new(Mutex::new(HashMap::new())),
            threshold: threshold,
            reset_timeout: reset_timeout,
        }
    }

    /// Whether a call named `name` may proceed. An open circuit whose
    /// reset timeout has elapsed transitions to half-open and admits one
    /// probe attempt.
    pub fn admit(&self, name: &str) -> bool {
        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit.last_failure
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    debug!("circuit {} half-open", name);
                    circuit.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, name: &str) {
        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        if let Some(circuit) = circuits.get_mut(name) {
            if circuit.state != CircuitState::Closed {
                info!("circuit {} closed", name);
            }
            circuit.failures = 0;
            circuit.state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&self, name: &str) {
        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);
        circuit.last_failure = Some(Instant::now());
        match circuit.state {
            CircuitState::HalfOpen => {
                warn!("circuit {} re-opened", name);
                circuit.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                circuit.failures += 1;
                if circuit.failures >= self.threshold {
                    warn!("circuit {} opened after {} consecutive failures",
                          name,
                          circuit.failures);
                    circuit.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, name: &str) -> CircuitState {
        let circuits = self.circuits.lock().expect("breaker lock poisoned");
        circuits.get(name).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::{Breaker, CircuitState};

    #[test]
    fn opens_at_threshold_and_recovers() {
        let breaker = Breaker::new(3, Duration::from_millis(0));
        assert!(breaker.admit("scan"));
        breaker.record_failure("scan");
        breaker.record_failure("scan");
        assert_eq!(breaker.state("scan"), CircuitState::Closed);
        breaker.record_failure("scan");
        assert_eq!(breaker.state("scan"), CircuitState::Open);

        // Zero reset timeout: the next admit half-opens.
        assert!(breaker.admit("scan"));
        assert_eq!(breaker.state("scan"), CircuitState::HalfOpen);
        breaker.record_success("scan");
        assert_eq!(breaker.state("scan"), CircuitState::Closed);
    }

    #[test]
    fn open_circuit_rejects_within_reset_timeout() {
        let breaker = Breaker::new(1, Duration::from_secs(60));
        breaker.record_failure("scan");
        assert_eq!(breaker.state("scan"), CircuitState::Open);
        assert!(!breaker.admit("scan"));
        assert!(!breaker.admit("scan"));
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = Breaker::new(1, Duration::from_millis(0));
        breaker.record_failure("scan");
        assert!(breaker.admit("scan"));
        breaker.record_failure("scan");
        assert_eq!(breaker.state("scan"), CircuitState::Open);
    }
}
