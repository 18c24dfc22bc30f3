//! Engine error taxonomy.
//!
//! Fetch-side failures are plain cloneable values because a collapsed
//! request shares one outcome among every waiter; durability failures wrap
//! richer context and surface to exactly the submitting caller.

use thiserror::Error;

use crate::types::MonitorStatus;

/// Every failure kind the engine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The disk guard refused a write: under 100 MB free at the database
    /// directory.
    #[error("insufficient storage: {available_mb} MB free, {required_mb} MB required")]
    InsufficientStorage { available_mb: u64, required_mb: u64 },

    /// A schema migration aborted; the pre-migration backup was restored.
    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    /// The 15-second wall-clock bound expired; the connection was cancelled.
    #[error("fetch timed out after {0}s")]
    FetchTimeout(u64),

    /// DNS, TLS, or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with status >= 400.
    #[error("http status {0}")]
    HttpStatus(u16),

    /// The response body was a bot-challenge or denial page, not content.
    #[error("block page detected")]
    BlockPage,

    /// The host's circuit breaker is open; the request fast-failed.
    #[error("circuit open for {host}")]
    CircuitOpen { host: String },

    /// robots.txt disallows this path for our user-agent family.
    #[error("fetch disallowed by robots.txt")]
    PolicyBlocked,

    /// A command carried an invalid value; state was not mutated.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl WatchError {
    /// Whether this failure counts against the host's circuit breaker.
    ///
    /// Policy blocks and open-circuit fast-fails do not: the former is a
    /// healthy skip, the latter already reflects breaker state.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            WatchError::FetchTimeout(_)
                | WatchError::Network(_)
                | WatchError::HttpStatus(_)
                | WatchError::BlockPage
        )
    }

    /// Whether the patrol engine increments `consecutive_failures` for this.
    pub fn counts_as_monitor_failure(&self) -> bool {
        self.counts_as_breaker_failure() || matches!(self, WatchError::CircuitOpen { .. })
    }

    /// The `last_status` value recorded for this failure.
    pub fn monitor_status(&self) -> MonitorStatus {
        match self {
            WatchError::FetchTimeout(_) => MonitorStatus::Timeout,
            WatchError::Network(_) => MonitorStatus::NetworkError,
            WatchError::HttpStatus(_) => MonitorStatus::HttpError,
            WatchError::BlockPage => MonitorStatus::BlockPage,
            WatchError::CircuitOpen { .. } => MonitorStatus::CircuitOpen,
            WatchError::PolicyBlocked => MonitorStatus::PolicyBlocked,
            WatchError::InsufficientStorage { .. }
            | WatchError::MigrationFailed(_)
            | WatchError::ConfigInvalid(_) => MonitorStatus::Pending,
        }
    }
}
