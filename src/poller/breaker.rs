//! Per-connection circuit breaker.
//!
//! Three states persisted on the connection row and hydrated at the start of
//! every cycle. The breaker guards the *upstream*: webhook failures flow
//! into the retry queue and never trip it.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::models::connection::Model as ConnectionModel;

/// Consecutive hard failures before the breaker opens.
pub const FAILURE_THRESHOLD: i32 = 5;

/// Seconds an open breaker blocks upstream traffic before probing.
pub const RECOVERY_TIMEOUT_SECS: i64 = 120;

/// Probe successes required to close a half-open breaker.
pub const SUCCESS_THRESHOLD: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Parses the persisted representation; unknown values fall back to
    /// closed so a corrupt row cannot wedge a connection shut.
    pub fn parse(value: &str) -> Self {
        match value {
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker state machine. All transitions take an explicit `now` so tests
/// control the clock.
#[derive(Debug, Clone)]
pub struct Breaker {
    state: BreakerState,
    failure_count: i32,
    half_open_successes: i32,
    retry_at: Option<DateTime<Utc>>,
}

impl Breaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            retry_at: None,
        }
    }

    /// Hydrates from the persisted connection fields.
    pub fn from_connection(connection: &ConnectionModel) -> Self {
        Self {
            state: BreakerState::parse(&connection.breaker_state),
            failure_count: connection.breaker_failure_count,
            half_open_successes: connection.breaker_half_open_successes,
            retry_at: connection.breaker_retry_at.map(|at| at.with_timezone(&Utc)),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> i32 {
        self.failure_count
    }

    pub fn half_open_successes(&self) -> i32 {
        self.half_open_successes
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    /// Gate check at cycle start. An open breaker admits exactly one probe
    /// once the recovery window has elapsed, transitioning to half-open.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => match self.retry_at {
                Some(retry_at) if now >= retry_at => {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                }
                _ => false,
            },
        }
    }

    /// Reported exactly once per executed cycle.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= SUCCESS_THRESHOLD {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.half_open_successes = 0;
                    self.retry_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Reported exactly once per executed cycle that hit a hard upstream
    /// fault.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;

        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.half_open_successes = 0;
                self.retry_at = Some(now + Duration::seconds(RECOVERY_TIMEOUT_SECS));
            }
            BreakerState::Closed => {
                if self.failure_count >= FAILURE_THRESHOLD {
                    self.state = BreakerState::Open;
                    self.retry_at = Some(now + Duration::seconds(RECOVERY_TIMEOUT_SECS));
                }
            }
            BreakerState::Open => {
                self.retry_at = Some(now + Duration::seconds(RECOVERY_TIMEOUT_SECS));
            }
        }
    }

    /// Operator reset.
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.retry_at = None;
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}
