//! Circuit Breaker Service
//!
//! One breaker per (user, action class), cycling CLOSED -> OPEN -> HALF_OPEN
//! -> CLOSED on reported outcomes.
//!
//! Every transition is a read-modify-write guarded by a compare-and-set on
//! the stored record, retried a bounded number of times, so concurrent
//! workers can never double-open or double-close a breaker. Gate checks are
//! read paths and fail open when the store is unreachable.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::notifier::{Notifier, SafetyNotification};
use super::store::{RecordKind, SafetyStore, StoreKey};
use crate::error::{ConflictReason, SafetyError};
use crate::models::{
    ActionClass, BreakerDecision, BreakerState, BreakerStateCounts, BreakerTransition,
    CircuitBreakerRecord, FailureKind, validate_user_id,
};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within the record TTL) that open a CLOSED breaker
    pub failure_threshold: u32,
    /// HALF_OPEN successes needed to close
    pub recovery_threshold: u32,
    /// How long an OPEN breaker blocks calls
    pub cooldown: Duration,
    /// Record expiry, refreshed on every write
    pub record_ttl: Duration,
    /// Breakers untouched for longer than this are removed by maintenance
    pub retention: Duration,
    /// A HALF_OPEN trial not reported back within this lease frees the slot
    pub trial_lease: Duration,
    pub max_cas_attempts: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_threshold: 2,
            cooldown: Duration::minutes(30),
            record_ttl: Duration::hours(24),
            retention: Duration::hours(24),
            trial_lease: Duration::minutes(5),
            max_cas_attempts: 8,
        }
    }
}

/// Record after an outcome was applied, and the state change it caused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResult {
    pub record: CircuitBreakerRecord,
    pub transition: BreakerTransition,
}

/// Breaker records population-wide
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerCensus {
    pub counts: BreakerStateCounts,
    /// Records that could not be parsed
    pub skipped: usize,
}

pub struct CircuitBreakerService {
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    config: CircuitBreakerConfig,
}

/// Stored value (raw, for compare-and-set) and its parsed form
struct Loaded {
    raw: Option<String>,
    record: CircuitBreakerRecord,
}

impl CircuitBreakerService {
    pub fn new(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Create a CLOSED breaker unless one already exists. Never overwrites.
    pub async fn initialize_circuit_breaker(
        &self,
        user_id: &str,
        action_class: ActionClass,
    ) -> Result<CircuitBreakerRecord, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let key = StoreKey::breaker(user_id, action_class.as_str());
        let record = CircuitBreakerRecord::closed(user_id, action_class, now);

        if self
            .store
            .set_if_absent(&key, encode(&record), Some(now + self.config.record_ttl))
            .await?
        {
            debug!(user_id = %user_id, action_class = %action_class, "Initialized circuit breaker");
            return Ok(record);
        }

        Ok(self.load(user_id, action_class).await?.record)
    }

    /// Gate check. Never raises; an unreachable store or corrupted record fails open.
    ///
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN here and
    /// admits exactly one trial call.
    pub async fn is_operation_allowed(&self, user_id: &str, action_class: ActionClass) -> BreakerDecision {
        if let Err(msg) = validate_user_id(user_id) {
            return BreakerDecision {
                allowed: false,
                state: BreakerState::Closed,
                retry_after: None,
                reason: Some(msg),
            };
        }

        let key = StoreKey::breaker(user_id, action_class.as_str());

        for _ in 0..self.config.max_cas_attempts {
            let loaded = match self.load(user_id, action_class).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        action_class = %action_class,
                        error = %e,
                        "Breaker state unavailable, failing open"
                    );
                    return allow(BreakerState::Closed);
                }
            };
            let now = self.clock.now();
            let record = &loaded.record;

            let mut next = record.clone();
            match record.state {
                BreakerState::Closed => return allow(BreakerState::Closed),
                BreakerState::Open => {
                    let resume_at = record.next_attempt_time.unwrap_or(now);
                    if now < resume_at {
                        return deny(BreakerState::Open, resume_at - now, "circuit breaker open");
                    }
                    next.state = BreakerState::HalfOpen;
                    next.success_count = 0;
                }
                BreakerState::HalfOpen => {
                    if let Some(started) = record.trial_started_at {
                        let lease_end = started + self.config.trial_lease;
                        if now < lease_end {
                            return deny(BreakerState::HalfOpen, lease_end - now, "trial call in progress");
                        }
                    }
                }
            }

            next.trial_started_at = Some(now);
            next.updated_at = now;

            match self.write(&key, loaded.raw.as_deref(), &next, now).await {
                Ok(true) => {
                    if record.state == BreakerState::Open {
                        info!(user_id = %user_id, action_class = %action_class, "Circuit breaker half-open");
                    }
                    return allow(BreakerState::HalfOpen);
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        action_class = %action_class,
                        error = %e,
                        "Breaker write failed, failing open"
                    );
                    return allow(next.state);
                }
            }
        }

        debug!(user_id = %user_id, action_class = %action_class, "Breaker check lost every race");
        deny(BreakerState::HalfOpen, Duration::seconds(1), "concurrent breaker update")
    }

    /// Apply a successful call
    pub async fn record_success(
        &self,
        user_id: &str,
        action_class: ActionClass,
    ) -> Result<OutcomeResult, SafetyError> {
        let recovery_threshold = self.config.recovery_threshold;

        let result = self
            .transition(user_id, action_class, false, |record, now| {
                if record.state != BreakerState::HalfOpen {
                    // CLOSED keeps its failure history; a late success on OPEN is ignored
                    return None;
                }
                let mut next = record;
                next.success_count += 1;
                next.trial_started_at = None;
                next.updated_at = now;
                if next.success_count >= recovery_threshold {
                    next.state = BreakerState::Closed;
                    next.failure_count = 0;
                    next.success_count = 0;
                    next.next_attempt_time = None;
                    return Some((next, BreakerTransition::Closed));
                }
                Some((next, BreakerTransition::None))
            })
            .await?;

        if result.transition == BreakerTransition::Closed {
            info!(user_id = %user_id, action_class = %action_class, "Circuit breaker closed");
            self.notify(SafetyNotification::breaker_closed(
                user_id,
                action_class,
                result.record.updated_at,
            ))
            .await;
        }

        Ok(result)
    }

    /// Apply a failed call.
    ///
    /// Suspension signals bypass the threshold: the breaker is forced OPEN
    /// without counting the failure and the result asks the caller to
    /// escalate to an emergency stop.
    pub async fn record_failure(
        &self,
        user_id: &str,
        action_class: ActionClass,
        kind: FailureKind,
    ) -> Result<OutcomeResult, SafetyError> {
        let failure_threshold = self.config.failure_threshold;
        let cooldown = self.config.cooldown;

        let result = self
            .transition(user_id, action_class, true, |record, now| {
                let mut next = record;
                next.last_failure_time = Some(now);
                next.updated_at = now;

                let open = |next: &mut CircuitBreakerRecord| {
                    next.state = BreakerState::Open;
                    next.success_count = 0;
                    next.trial_started_at = None;
                    next.next_attempt_time = Some(now + cooldown);
                };

                let transition = if kind.is_suspension_signal() {
                    open(&mut next);
                    BreakerTransition::EscalationRequired
                } else {
                    next.failure_count += 1;
                    match next.state {
                        BreakerState::Closed if next.failure_count >= failure_threshold => {
                            open(&mut next);
                            BreakerTransition::Opened
                        }
                        BreakerState::HalfOpen => {
                            open(&mut next);
                            BreakerTransition::Reopened
                        }
                        _ => BreakerTransition::None,
                    }
                };
                Some((next, transition))
            })
            .await?;

        match result.transition {
            BreakerTransition::Opened | BreakerTransition::Reopened | BreakerTransition::EscalationRequired => {
                warn!(
                    user_id = %user_id,
                    action_class = %action_class,
                    failure_kind = kind.as_str(),
                    failure_count = result.record.failure_count,
                    transition = ?result.transition,
                    "Circuit breaker opened"
                );
                self.notify(SafetyNotification::breaker_opened(&result.record)).await;
            }
            _ => {
                debug!(
                    user_id = %user_id,
                    action_class = %action_class,
                    failure_count = result.record.failure_count,
                    "Recorded breaker failure"
                );
            }
        }

        Ok(result)
    }

    /// Stored breaker, `None` if the user has none for this class
    pub async fn get_breaker(
        &self,
        user_id: &str,
        action_class: ActionClass,
    ) -> Result<Option<CircuitBreakerRecord>, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let key = StoreKey::breaker(user_id, action_class.as_str());
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SafetyError::CorruptedRecord {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Every stored breaker for a user; corrupted records are skipped
    pub async fn list_user_breakers(&self, user_id: &str) -> Result<Vec<CircuitBreakerRecord>, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let keys: Vec<StoreKey> = ActionClass::ALL
            .iter()
            .map(|class| StoreKey::breaker(user_id, class.as_str()))
            .collect();
        let values = self.store.get_many(&keys).await?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, raw)| parse_or_skip(key, raw?))
            .collect())
    }

    /// Administrative force-close
    pub async fn reset_breaker(
        &self,
        user_id: &str,
        action_class: ActionClass,
    ) -> Result<CircuitBreakerRecord, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let key = StoreKey::breaker(user_id, action_class.as_str());
        let previous = self.get_breaker(user_id, action_class).await.ok().flatten();
        let record = CircuitBreakerRecord::closed(user_id, action_class, now);

        self.store
            .set(&key, encode(&record), Some(now + self.config.record_ttl))
            .await?;

        if previous.is_some_and(|p| p.state != BreakerState::Closed) {
            info!(user_id = %user_id, action_class = %action_class, "Circuit breaker reset");
            self.notify(SafetyNotification::breaker_closed(user_id, action_class, now))
                .await;
        }

        Ok(record)
    }

    /// Close every non-CLOSED breaker a user has. Returns how many were closed.
    pub async fn close_user_breakers(&self, user_id: &str) -> Result<usize, SafetyError> {
        let mut closed = 0;

        for class in ActionClass::ALL {
            let result = self
                .transition(user_id, class, false, |record, now| {
                    if record.state == BreakerState::Closed {
                        return None;
                    }
                    let mut next = CircuitBreakerRecord::closed(&record.user_id, record.action_class, now);
                    next.last_failure_time = record.last_failure_time;
                    Some((next, BreakerTransition::Closed))
                })
                .await?;

            if result.transition == BreakerTransition::Closed {
                closed += 1;
                self.notify(SafetyNotification::breaker_closed(user_id, class, result.record.updated_at))
                    .await;
            }
        }

        Ok(closed)
    }

    /// Breaker state counts population-wide; corrupted records are skipped
    pub async fn state_counts(&self) -> Result<BreakerCensus, SafetyError> {
        let keys = self.store.keys(RecordKind::Breaker).await?;
        let values = self.store.get_many(&keys).await?;

        let mut census = BreakerCensus::default();
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match parse_or_skip(key, raw) {
                Some(record) => census.counts.add(record.state),
                None => census.skipped += 1,
            }
        }
        Ok(census)
    }

    /// Delete breakers untouched beyond the retention window.
    ///
    /// Deletion is conditional on the record being unchanged since it was read.
    pub async fn cleanup_stale(&self) -> Result<usize, SafetyError> {
        let cutoff = self.clock.now() - self.config.retention;
        let keys = self.store.keys(RecordKind::Breaker).await?;
        let values = self.store.get_many(&keys).await?;

        let mut removed = 0;
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            let stale = match serde_json::from_str::<CircuitBreakerRecord>(&raw) {
                Ok(record) => record.updated_at < cutoff,
                Err(_) => true,
            };
            if stale && self.store.delete_if_equals(key, &raw).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed stale circuit breakers");
        }
        Ok(removed)
    }

    /// Read-modify-write loop guarded by compare-and-set.
    ///
    /// `apply` returns `None` when no write is needed. A missing record is
    /// created only when `create_missing` is set.
    async fn transition<F>(
        &self,
        user_id: &str,
        action_class: ActionClass,
        create_missing: bool,
        mut apply: F,
    ) -> Result<OutcomeResult, SafetyError>
    where
        F: FnMut(CircuitBreakerRecord, DateTime<Utc>) -> Option<(CircuitBreakerRecord, BreakerTransition)>,
    {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;
        let key = StoreKey::breaker(user_id, action_class.as_str());

        for attempt in 0..self.config.max_cas_attempts {
            let loaded = self.load(user_id, action_class).await?;
            let now = self.clock.now();

            if loaded.raw.is_none() && !create_missing {
                return Ok(OutcomeResult {
                    record: loaded.record,
                    transition: BreakerTransition::None,
                });
            }

            let Some((next, transition)) = apply(loaded.record.clone(), now) else {
                return Ok(OutcomeResult {
                    record: loaded.record,
                    transition: BreakerTransition::None,
                });
            };

            if self.write(&key, loaded.raw.as_deref(), &next, now).await? {
                return Ok(OutcomeResult {
                    record: next,
                    transition,
                });
            }
            debug!(user_id = %user_id, action_class = %action_class, attempt, "Breaker update lost a race, retrying");
        }

        Err(SafetyError::conflict(user_id, ConflictReason::ConcurrentModification))
    }

    /// Current record; missing or corrupted records read as a fresh CLOSED breaker
    async fn load(&self, user_id: &str, action_class: ActionClass) -> Result<Loaded, SafetyError> {
        let key = StoreKey::breaker(user_id, action_class.as_str());
        let raw = self.store.get(&key).await?;
        let now = self.clock.now();

        let record = match raw.as_deref() {
            None => CircuitBreakerRecord::closed(user_id, action_class, now),
            Some(value) => match serde_json::from_str(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Corrupted breaker record, treating as closed");
                    CircuitBreakerRecord::closed(user_id, action_class, now)
                }
            },
        };

        Ok(Loaded { raw, record })
    }

    async fn write(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        next: &CircuitBreakerRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, SafetyError> {
        let expires_at = Some(now + self.config.record_ttl);
        let written = match expected {
            Some(expected) => {
                self.store
                    .compare_and_set(key, expected, encode(next), expires_at)
                    .await?
            }
            None => self.store.set_if_absent(key, encode(next), expires_at).await?,
        };
        Ok(written)
    }

    async fn notify(&self, notification: SafetyNotification) {
        if let Err(e) = self.notifier.publish(notification).await {
            warn!(error = %e, "Failed to publish breaker notification");
        }
    }
}

fn allow(state: BreakerState) -> BreakerDecision {
    BreakerDecision {
        allowed: true,
        state,
        retry_after: None,
        reason: None,
    }
}

fn deny(state: BreakerState, wait: Duration, reason: &str) -> BreakerDecision {
    BreakerDecision {
        allowed: false,
        state,
        retry_after: Some(ceil_secs(wait)),
        reason: Some(reason.to_string()),
    }
}

fn ceil_secs(wait: Duration) -> u64 {
    let millis = wait.num_milliseconds().max(0);
    (((millis + 999) / 1000).max(1)) as u64
}

fn parse_or_skip(key: &StoreKey, raw: String) -> Option<CircuitBreakerRecord> {
    match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!(key = %key, error = %e, "Skipping corrupted breaker record");
            None
        }
    }
}

fn encode(record: &CircuitBreakerRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}
