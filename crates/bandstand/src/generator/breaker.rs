//! Circuit breaker for the external generator.
//!
//! After `threshold` consecutive failures the circuit opens and calls
//! fail fast for `cooldown`. The first call after the cooldown is a
//! half-open probe: success closes the circuit, failure re-opens it
//! with a fresh timer. Any success resets the failure counter.

use std::time::{Duration, Instant};

use tracing::{error, info};

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            failures: 0,
            opened_at: None,
        }
    }

    /// True while the cooldown window is running. Once the window
    /// elapses the breaker reports closed so one probe can pass.
    pub fn is_open(&self) -> bool {
        match self.opened_at {
            None => false,
            Some(at) => at.elapsed() < self.cooldown,
        }
    }

    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            info!("generator circuit breaker closed after successful request");
        }
        self.failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        match self.opened_at {
            None if self.failures >= self.threshold => {
                self.opened_at = Some(Instant::now());
                error!(
                    failures = self.failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "generator circuit breaker open, failing fast"
                );
            }
            Some(at) if at.elapsed() >= self.cooldown => {
                // The half-open probe failed: restart the window.
                self.opened_at = Some(Instant::now());
                error!(
                    cooldown_secs = self.cooldown.as_secs(),
                    "generator circuit breaker re-opened after failed probe"
                );
            }
            _ => {}
        }
    }

}
