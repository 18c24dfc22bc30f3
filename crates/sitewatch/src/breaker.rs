//! Per-host circuit breakers.
//!
//! Each host (scheme + authority of the normalized URL) owns a small state
//! machine: CLOSED admits everything, OPEN fast-fails for an hour, and
//! HALF_OPEN admits exactly one probing request whose outcome decides
//! between recovery and another hour of cooldown.
//!
//! The registry itself is in-memory and single-writer (the request
//! manager); state is mirrored into monitor metadata on every patrol write
//! so breakers survive restart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::WatchError;
use crate::types::CircuitState;

/// Consecutive failures that trip a CLOSED breaker.
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long an OPEN breaker cools down before probing.
pub const COOLDOWN_SECONDS: i64 = 3_600;

/// What a recorded outcome did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No state change.
    None,
    /// The breaker tripped CLOSED → OPEN.
    Opened,
    /// A failed probe sent HALF_OPEN back to OPEN, restarting the cooldown.
    Reopened,
    /// A successful probe recovered the host.
    Recovered,
}

#[derive(Debug, Clone)]
struct HostBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for HostBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// All per-host breakers, keyed by `scheme://authority`.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    hosts: HashMap<String, HostBreaker>,
}

/// A read-only view of one host's breaker for persistence and health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerView {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a request to `host` may proceed now.
    ///
    /// An OPEN breaker whose cooldown has lapsed moves to HALF_OPEN and
    /// admits this caller as the single probe; while a probe is in flight
    /// everyone else keeps fast-failing.
    pub fn permit(&mut self, host: &str, now: DateTime<Utc>) -> Result<(), WatchError> {
        let entry = self.hosts.entry(host.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let lapsed = entry
                    .opened_at
                    .is_none_or(|at| now - at >= Duration::seconds(COOLDOWN_SECONDS));
                if lapsed {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    tracing::info!(host, "circuit half-open; probing");
                    Ok(())
                } else {
                    Err(WatchError::CircuitOpen {
                        host: host.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(WatchError::CircuitOpen {
                        host: host.to_string(),
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful (non-block) response.
    pub fn record_success(&mut self, host: &str) -> Transition {
        let entry = self.hosts.entry(host.to_string()).or_default();
        let was = entry.state;
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        entry.probe_in_flight = false;
        if was == CircuitState::Closed {
            Transition::None
        } else {
            tracing::info!(host, "circuit closed; host recovered");
            Transition::Recovered
        }
    }

    /// Record a countable failure (network, timeout, status >= 400, block page).
    pub fn record_failure(&mut self, host: &str, now: DateTime<Utc>) -> Transition {
        let entry = self.hosts.entry(host.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.probe_in_flight = false;
        match entry.state {
            CircuitState::Closed if entry.consecutive_failures >= FAILURE_THRESHOLD => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                tracing::warn!(host, failures = entry.consecutive_failures, "circuit opened");
                Transition::Opened
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                tracing::warn!(host, "probe failed; circuit reopened");
                Transition::Reopened
            }
            _ => Transition::None,
        }
    }

    /// Current view of one host's breaker.
    pub fn view(&self, host: &str) -> BreakerView {
        self.hosts
            .get(host)
            .map(|entry| BreakerView {
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                opened_at: entry.opened_at,
            })
            .unwrap_or(BreakerView {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })
    }

    /// Seed a host's breaker from persisted monitor metadata at boot.
    ///
    /// When several monitors report the same host, the most pessimistic
    /// state wins (an OPEN record outranks CLOSED; more failures outrank
    /// fewer).
    pub fn restore(
        &mut self,
        host: &str,
        state: CircuitState,
        consecutive_failures: u32,
        opened_at: Option<DateTime<Utc>>,
    ) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        let incoming_rank = rank(state);
        if incoming_rank > rank(entry.state)
            || (incoming_rank == rank(entry.state)
                && consecutive_failures > entry.consecutive_failures)
        {
            entry.state = state;
            entry.consecutive_failures = consecutive_failures;
            entry.opened_at = opened_at;
            entry.probe_in_flight = false;
        }
    }

    /// Count of hosts per breaker state, for the health snapshot.
    pub fn counts(&self) -> BreakerCounts {
        let mut counts = BreakerCounts::default();
        for entry in self.hosts.values() {
            match entry.state {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::Open => counts.open += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }
}

fn rank(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

/// Hosts per breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BreakerCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}
