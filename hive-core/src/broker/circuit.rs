//! Circuit breaker guarding the broker choke point.

use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Circuit is closed, allowing commands
    Closed,
    /// Circuit is open, blocking commands
    Open,
    /// Circuit is half-open, letting a trial command through
    HalfOpen,
}

/// Tracks consecutive broker failures and blocks commands once the
/// threshold is crossed, until a cooldown lets a trial command probe the
/// link again.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Current state of the circuit
    state: CircuitState,
    /// Number of consecutive failures
    failure_count: u32,
    /// Failure threshold before opening the circuit
    threshold: u32,
    /// Time the circuit stays open before a trial is allowed
    cooldown: Duration,
    /// Last failure timestamp
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            threshold,
            cooldown,
            last_failure: None,
        }
    }

    /// Records a failure and potentially opens the circuit.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.failure_count >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    /// Records a success and closes the circuit.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
        self.state = CircuitState::Closed;
    }

    /// Whether a command should be allowed through right now.
    ///
    /// An open circuit transitions to half-open once the cooldown has
    /// elapsed, letting a single trial command test the link.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}
