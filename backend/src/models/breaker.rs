//! Circuit breaker records
//!
//! Persisted per (user, action class). The record is rewritten with a
//! compare-and-set on every transition so concurrent workers never
//! double-open or double-close a breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActionClass;

/// Breaker state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are blocked until `next_attempt_time`
    Open,
    /// A single trial call is allowed at a time
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored breaker for one user and action class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerRecord {
    pub user_id: String,
    pub action_class: ActionClass,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Set while a HALF_OPEN trial call is outstanding
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerRecord {
    pub fn closed(user_id: &str, action_class: ActionClass, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            action_class,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            trial_started_at: None,
            updated_at: now,
        }
    }
}

/// Answer to "may this user perform an action of this class right now?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerDecision {
    pub allowed: bool,
    pub state: BreakerState,
    /// Seconds until the breaker will consider another call
    pub retry_after: Option<u64>,
    pub reason: Option<String>,
}

/// Population-wide breaker state counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStateCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

impl BreakerStateCounts {
    pub fn add(&mut self, state: BreakerState) {
        match state {
            BreakerState::Closed => self.closed += 1,
            BreakerState::Open => self.open += 1,
            BreakerState::HalfOpen => self.half_open += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.closed + self.open + self.half_open
    }
}

/// State change produced by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTransition {
    /// Counters moved, state did not
    None,
    /// CLOSED -> OPEN after reaching the failure threshold
    Opened,
    /// HALF_OPEN -> OPEN after a failed trial
    Reopened,
    /// HALF_OPEN -> CLOSED after reaching the recovery threshold
    Closed,
    /// Suspension signal: breaker forced OPEN and automation must stop
    EscalationRequired,
}
