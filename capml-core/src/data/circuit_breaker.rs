//! Broker cooldown gate.
//!
//! Rejected logins and login rate limits close the gate for the full
//! cooldown. Rate limits on data endpoints count as strikes and close it
//! after `strike_limit` in a row, for at least the server's `Retry-After`.
//! While closed no request is sent, re-authentication included.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Gate {
    strikes: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    gate: Mutex<Gate>,
    cooldown: Duration,
    strike_limit: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            cooldown,
            strike_limit: 3,
        }
    }

    pub fn with_strike_limit(mut self, limit: u32) -> Self {
        self.strike_limit = limit.max(1);
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a request may go out now. An expired block is cleared here.
    pub fn is_allowed(&self) -> bool {
        let mut gate = self.gate.lock().unwrap();
        match gate.blocked_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *gate = Gate::default();
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.gate.lock().unwrap().strikes = 0;
    }

    /// One rate-limited response. `retry_after` extends the block when the
    /// server asks for longer than the cooldown.
    pub fn record_failure(&self, retry_after: Option<Duration>) {
        let mut gate = self.gate.lock().unwrap();
        gate.strikes += 1;
        if gate.strikes >= self.strike_limit {
            let wait = retry_after.map_or(self.cooldown, |r| r.max(self.cooldown));
            gate.blocked_until = Some(Instant::now() + wait);
        }
    }

    /// Block for the full cooldown (login rejected or rate limited).
    pub fn trip(&self) {
        self.gate.lock().unwrap().blocked_until = Some(Instant::now() + self.cooldown);
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match self.gate.lock().unwrap().blocked_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }
}
