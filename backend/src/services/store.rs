//! Safety Store
//!
//! Repository interface over the shared mutable state every engine component
//! reads and writes: typed JSON records, atomic window counters, bounded
//! newest-first logs and a time-ordered index.
//!
//! Keys are structured (`kind`, `user`, `resource`, `window`) rather than
//! concatenated strings. Global keys carry an empty user id, which user-id
//! validation rejects, so they never collide with a real user's keys.
//!
//! Implementations: `InMemoryStore` (tests and single-node deployments),
//! `PostgresStore` (see `pg_store`), and the `TimeoutStore` decorator that
//! bounds every call.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use super::clock::Clock;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Record families held in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// Window counter
    Counter,
    /// Circuit breaker record
    Breaker,
    /// Active emergency stop record
    EmergencyStop,
    /// Per-user recent activity log
    Activity,
    /// Fleet-wide outcome log used for limit recalibration
    Outcomes,
    /// Per-user violation log
    Violations,
    /// Per-user emergency stop history
    StopLog,
    /// Per-user resume attribution log
    ResumeLog,
    /// Global time-ordered stop index
    StopIndex,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Breaker => "breaker",
            Self::EmergencyStop => "emergency_stop",
            Self::Activity => "activity",
            Self::Outcomes => "outcomes",
            Self::Violations => "violations",
            Self::StopLog => "stop_log",
            Self::ResumeLog => "resume_log",
            Self::StopIndex => "stop_index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(Self::Counter),
            "breaker" => Some(Self::Breaker),
            "emergency_stop" => Some(Self::EmergencyStop),
            "activity" => Some(Self::Activity),
            "outcomes" => Some(Self::Outcomes),
            "violations" => Some(Self::Violations),
            "stop_log" => Some(Self::StopLog),
            "resume_log" => Some(Self::ResumeLog),
            "stop_index" => Some(Self::StopIndex),
            _ => None,
        }
    }
}

/// Structured composite key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub kind: RecordKind,
    /// Empty for global keys
    pub user: String,
    pub resource: Option<String>,
    pub window: Option<String>,
}

impl StoreKey {
    fn new(kind: RecordKind, user: &str) -> Self {
        Self {
            kind,
            user: user.to_string(),
            resource: None,
            window: None,
        }
    }

    /// Window counter; `resource` is the action, or `None` for the cross-action total
    pub fn counter(user: &str, resource: Option<&str>, window: &str) -> Self {
        Self {
            kind: RecordKind::Counter,
            user: user.to_string(),
            resource: resource.map(str::to_string),
            window: Some(window.to_string()),
        }
    }

    pub fn breaker(user: &str, action_class: &str) -> Self {
        Self {
            resource: Some(action_class.to_string()),
            ..Self::new(RecordKind::Breaker, user)
        }
    }

    pub fn emergency_stop(user: &str) -> Self {
        Self::new(RecordKind::EmergencyStop, user)
    }

    pub fn activity(user: &str) -> Self {
        Self::new(RecordKind::Activity, user)
    }

    pub fn violations(user: &str) -> Self {
        Self::new(RecordKind::Violations, user)
    }

    pub fn stop_log(user: &str) -> Self {
        Self::new(RecordKind::StopLog, user)
    }

    pub fn resume_log(user: &str) -> Self {
        Self::new(RecordKind::ResumeLog, user)
    }

    pub fn outcomes() -> Self {
        Self::new(RecordKind::Outcomes, "")
    }

    pub fn stop_index() -> Self {
        Self::new(RecordKind::StopIndex, "")
    }

    pub fn is_global(&self) -> bool {
        self.user.is_empty()
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[user={:?}", self.kind.as_str(), self.user)?;
        if let Some(resource) = &self.resource {
            write!(f, " resource={resource:?}")?;
        }
        if let Some(window) = &self.window {
            write!(f, " window={window:?}")?;
        }
        write!(f, "]")
    }
}

/// Repository interface for all engine state
///
/// Every single-key operation is atomic. Cross-key operations are not
/// transactional; callers are written to tolerate interleaving.
#[async_trait]
pub trait SafetyStore: Send + Sync {
    /// Read a record
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError>;

    /// Read several records in one round trip (same order as `keys`)
    async fn get_many(&self, keys: &[StoreKey]) -> Result<Vec<Option<String>>, StoreError>;

    /// Write a record, replacing any previous value
    async fn set(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Write a record only if no live record exists. Returns whether it was written.
    async fn set_if_absent(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Replace a record only if it still holds `expected`. Returns whether it was replaced.
    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: &str,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Delete a record. Returns whether a live record existed.
    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError>;

    /// Delete a record only if it still holds `expected`
    async fn delete_if_equals(&self, key: &StoreKey, expected: &str) -> Result<bool, StoreError>;

    /// Atomically increment each counter, creating it with the given expiry
    /// (or restarting it at 1 if its previous expiry has passed). Returns new counts.
    async fn increment_all(
        &self,
        counters: &[(StoreKey, DateTime<Utc>)],
    ) -> Result<Vec<u64>, StoreError>;

    /// Current counts, zero for missing or expired counters
    async fn get_counts(&self, keys: &[StoreKey]) -> Result<Vec<u64>, StoreError>;

    /// Prepend to a bounded newest-first log and refresh the log's expiry
    async fn push_bounded(
        &self,
        key: &StoreKey,
        value: String,
        max_len: usize,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Up to `limit` newest log entries, newest first
    async fn recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Add a member to a time-ordered index
    async fn index_add(&self, key: &StoreKey, score: i64, member: String)
    -> Result<(), StoreError>;

    /// Up to `limit` members with the highest scores, highest first
    async fn index_recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Remove members scored below `min_score`. Returns how many were removed.
    async fn index_remove_below(&self, key: &StoreKey, min_score: i64) -> Result<u64, StoreError>;

    /// Live keys of one kind
    async fn keys(&self, kind: RecordKind) -> Result<Vec<StoreKey>, StoreError>;

    /// Physically remove expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
enum Slot {
    Value(String),
    Counter(u64),
    Log(VecDeque<String>),
    Index(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory store with clock-driven expiry
///
/// A single `RwLock` around the map makes every operation atomic.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<StoreKey, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries (for testing/monitoring)
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn live_value(entry: Option<&Entry>, now: DateTime<Utc>) -> Option<&String> {
        match entry {
            Some(Entry {
                slot: Slot::Value(v),
                expires_at,
            }) if expires_at.is_none_or(|at| at > now) => Some(v),
            _ => None,
        }
    }
}

#[async_trait]
impl SafetyStore for InMemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(Self::live_value(entries.get(key), now).cloned())
    }

    async fn get_many(&self, keys: &[StoreKey]) -> Result<Vec<Option<String>>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| Self::live_value(entries.get(key), now).cloned())
            .collect())
    }

    async fn set(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.clone(),
            Entry {
                slot: Slot::Value(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.clone(),
            Entry {
                slot: Slot::Value(value),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: &str,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if Self::live_value(entries.get(key), now).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        entries.insert(
            key.clone(),
            Entry {
                slot: Slot::Value(value),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &StoreKey, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if Self::live_value(entries.get(key), now).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn increment_all(
        &self,
        counters: &[(StoreKey, DateTime<Utc>)],
    ) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let mut counts = Vec::with_capacity(counters.len());

        for (key, expires_at) in counters {
            let entry = entries.entry(key.clone()).or_insert(Entry {
                slot: Slot::Counter(0),
                expires_at: Some(*expires_at),
            });
            let live = entry.is_live(now);
            if let (Slot::Counter(count), true) = (&mut entry.slot, live) {
                *count += 1;
                counts.push(*count);
                continue;
            }
            entry.slot = Slot::Counter(1);
            entry.expires_at = Some(*expires_at);
            counts.push(1);
        }

        Ok(counts)
    }

    async fn get_counts(&self, keys: &[StoreKey]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| match entries.get(key) {
                Some(entry) if entry.is_live(now) => match entry.slot {
                    Slot::Counter(count) => count,
                    _ => 0,
                },
                _ => 0,
            })
            .collect())
    }

    async fn push_bounded(
        &self,
        key: &StoreKey,
        value: String,
        max_len: usize,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert(Entry {
            slot: Slot::Log(VecDeque::new()),
            expires_at,
        });
        if !entry.is_live(now) || !matches!(entry.slot, Slot::Log(_)) {
            entry.slot = Slot::Log(VecDeque::new());
        }
        if let Slot::Log(log) = &mut entry.slot {
            log.push_front(value);
            log.truncate(max_len.max(1));
        }
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(Entry {
                slot: Slot::Log(log),
                expires_at,
            }) if expires_at.is_none_or(|at| at > now) => {
                log.iter().take(limit).cloned().collect()
            }
            _ => Vec::new(),
        })
    }

    async fn index_add(
        &self,
        key: &StoreKey,
        score: i64,
        member: String,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert(Entry {
            slot: Slot::Index(Vec::new()),
            expires_at: None,
        });
        if !matches!(entry.slot, Slot::Index(_)) {
            entry.slot = Slot::Index(Vec::new());
        }
        if let Slot::Index(members) = &mut entry.slot {
            members.push((score, member));
        }
        Ok(())
    }

    async fn index_recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        let Some(Entry {
            slot: Slot::Index(members),
            ..
        }) = entries.get(key)
        else {
            return Ok(Vec::new());
        };

        let mut sorted: Vec<&(i64, String)> = members.iter().collect();
        sorted.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(sorted
            .into_iter()
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn index_remove_below(&self, key: &StoreKey, min_score: i64) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().await;
        let Some(Entry {
            slot: Slot::Index(members),
            ..
        }) = entries.get_mut(key)
        else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|(score, _)| *score >= min_score);
        Ok((before - members.len()) as u64)
    }

    async fn keys(&self, kind: RecordKind) -> Result<Vec<StoreKey>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        let mut keys: Vec<StoreKey> = entries
            .iter()
            .filter(|(key, entry)| key.kind == kind && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// Timeout decorator
// ============================================================================

/// Bounds every store call with a timeout
///
/// A timed-out call surfaces as `StoreError::Timeout`, which callers treat
/// exactly like an unreachable store.
pub struct TimeoutStore {
    inner: Arc<dyn SafetyStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn SafetyStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl SafetyStore for TimeoutStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn get_many(&self, keys: &[StoreKey]) -> Result<Vec<Option<String>>, StoreError> {
        self.bounded(self.inner.get_many(keys)).await
    }

    async fn set(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.bounded(self.inner.set(key, value, expires_at)).await
    }

    async fn set_if_absent(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.bounded(self.inner.set_if_absent(key, value, expires_at))
            .await
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: &str,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.bounded(self.inner.compare_and_set(key, expected, value, expires_at))
            .await
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        self.bounded(self.inner.delete(key)).await
    }

    async fn delete_if_equals(&self, key: &StoreKey, expected: &str) -> Result<bool, StoreError> {
        self.bounded(self.inner.delete_if_equals(key, expected))
            .await
    }

    async fn increment_all(
        &self,
        counters: &[(StoreKey, DateTime<Utc>)],
    ) -> Result<Vec<u64>, StoreError> {
        self.bounded(self.inner.increment_all(counters)).await
    }

    async fn get_counts(&self, keys: &[StoreKey]) -> Result<Vec<u64>, StoreError> {
        self.bounded(self.inner.get_counts(keys)).await
    }

    async fn push_bounded(
        &self,
        key: &StoreKey,
        value: String,
        max_len: usize,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.bounded(self.inner.push_bounded(key, value, max_len, expires_at))
            .await
    }

    async fn recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        self.bounded(self.inner.recent(key, limit)).await
    }

    async fn index_add(
        &self,
        key: &StoreKey,
        score: i64,
        member: String,
    ) -> Result<(), StoreError> {
        self.bounded(self.inner.index_add(key, score, member)).await
    }

    async fn index_recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        self.bounded(self.inner.index_recent(key, limit)).await
    }

    async fn index_remove_below(&self, key: &StoreKey, min_score: i64) -> Result<u64, StoreError> {
        self.bounded(self.inner.index_remove_below(key, min_score))
            .await
    }

    async fn keys(&self, kind: RecordKind) -> Result<Vec<StoreKey>, StoreError> {
        self.bounded(self.inner.keys(kind)).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.bounded(self.inner.purge_expired()).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(self.inner.ping()).await
    }
}

// ============================================================================
// Unreachable store
// ============================================================================

/// Store that fails every call, for exercising fail-open and fail-closed paths
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl UnavailableStore {
    fn err<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl SafetyStore for UnavailableStore {
    async fn get(&self, _: &StoreKey) -> Result<Option<String>, StoreError> {
        Self::err()
    }
    async fn get_many(&self, _: &[StoreKey]) -> Result<Vec<Option<String>>, StoreError> {
        Self::err()
    }
    async fn set(&self, _: &StoreKey, _: String, _: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        Self::err()
    }
    async fn set_if_absent(
        &self,
        _: &StoreKey,
        _: String,
        _: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        Self::err()
    }
    async fn compare_and_set(
        &self,
        _: &StoreKey,
        _: &str,
        _: String,
        _: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        Self::err()
    }
    async fn delete(&self, _: &StoreKey) -> Result<bool, StoreError> {
        Self::err()
    }
    async fn delete_if_equals(&self, _: &StoreKey, _: &str) -> Result<bool, StoreError> {
        Self::err()
    }
    async fn increment_all(&self, _: &[(StoreKey, DateTime<Utc>)]) -> Result<Vec<u64>, StoreError> {
        Self::err()
    }
    async fn get_counts(&self, _: &[StoreKey]) -> Result<Vec<u64>, StoreError> {
        Self::err()
    }
    async fn push_bounded(
        &self,
        _: &StoreKey,
        _: String,
        _: usize,
        _: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        Self::err()
    }
    async fn recent(&self, _: &StoreKey, _: usize) -> Result<Vec<String>, StoreError> {
        Self::err()
    }
    async fn index_add(&self, _: &StoreKey, _: i64, _: String) -> Result<(), StoreError> {
        Self::err()
    }
    async fn index_recent(&self, _: &StoreKey, _: usize) -> Result<Vec<String>, StoreError> {
        Self::err()
    }
    async fn index_remove_below(&self, _: &StoreKey, _: i64) -> Result<u64, StoreError> {
        Self::err()
    }
    async fn keys(&self, _: RecordKind) -> Result<Vec<StoreKey>, StoreError> {
        Self::err()
    }
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Self::err()
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Self::err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn setup() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap(),
        ));
        let store = InMemoryStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn test_keys_are_structured() {
        // A user id containing separator characters cannot alias another key
        let a = StoreKey::counter("alice:invitation", None, "d20261015");
        let b = StoreKey::counter("alice", Some("invitation"), "d20261015");
        assert_ne!(a, b);
        assert!(StoreKey::stop_index().is_global());
        assert!(!StoreKey::activity("alice").is_global());
    }

    #[tokio::test]
    async fn test_counter_expires_at_window_end() {
        let (clock, store) = setup();
        let key = StoreKey::counter("u1", Some("like"), "h2026101509");
        let window_end = clock.now() + ChronoDuration::hours(1);

        assert_eq!(store.increment_all(&[(key.clone(), window_end)]).await.unwrap(), vec![1]);
        assert_eq!(store.increment_all(&[(key.clone(), window_end)]).await.unwrap(), vec![2]);
        assert_eq!(store.get_counts(&[key.clone()]).await.unwrap(), vec![2]);

        clock.advance(ChronoDuration::hours(1));
        assert_eq!(store.get_counts(&[key.clone()]).await.unwrap(), vec![0]);

        let next_end = clock.now() + ChronoDuration::hours(1);
        assert_eq!(store.increment_all(&[(key, next_end)]).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (clock, store) = setup();
        let store = Arc::new(store);
        let key = StoreKey::counter("u1", None, "d20261015");
        let end = clock.now() + ChronoDuration::days(1);

        let mut handles = vec![];
        for _ in 0..50 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.increment_all(&[(key, end)]).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.expect("Task should not panic");
        }

        assert_eq!(store.get_counts(&[key]).await.unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (_, store) = setup();
        let key = StoreKey::breaker("u1", "connection");

        assert!(store.set_if_absent(&key, "a".into(), None).await.unwrap());
        assert!(!store.set_if_absent(&key, "b".into(), None).await.unwrap());
        assert!(!store.compare_and_set(&key, "b", "c".into(), None).await.unwrap());
        assert!(store.compare_and_set(&key, "a", "c".into(), None).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("c"));
        assert!(!store.delete_if_equals(&key, "a").await.unwrap());
        assert!(store.delete_if_equals(&key, "c").await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_record_is_absent() {
        let (clock, store) = setup();
        let key = StoreKey::emergency_stop("u1");
        store
            .set(&key, "stop".into(), Some(clock.now() + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(store.keys(RecordKind::EmergencyStop).await.unwrap().len(), 1);

        clock.advance(ChronoDuration::minutes(5));
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.keys(RecordKind::EmergencyStop).await.unwrap().is_empty());
        assert!(store.set_if_absent(&key, "again".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_log_keeps_newest() {
        let (_, store) = setup();
        let key = StoreKey::violations("u1");
        for i in 0..5 {
            store.push_bounded(&key, i.to_string(), 3, None).await.unwrap();
        }
        assert_eq!(store.recent(&key, 10).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(store.recent(&key, 2).await.unwrap(), vec!["4", "3"]);
    }

    #[tokio::test]
    async fn test_index_ordering_and_pruning() {
        let (_, store) = setup();
        let key = StoreKey::stop_index();
        store.index_add(&key, 20, "b".into()).await.unwrap();
        store.index_add(&key, 10, "a".into()).await.unwrap();
        store.index_add(&key, 30, "c".into()).await.unwrap();

        assert_eq!(store.index_recent(&key, 2).await.unwrap(), vec!["c", "b"]);
        assert_eq!(store.index_remove_below(&key, 20).await.unwrap(), 1);
        assert_eq!(store.index_recent(&key, 10).await.unwrap(), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = setup();
        store
            .set(
                &StoreKey::emergency_stop("u1"),
                "x".into(),
                Some(clock.now() + ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();
        store.set(&StoreKey::emergency_stop("u2"), "y".into(), None).await.unwrap();
        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_timeout_store_passes_through() {
        let (_, store) = setup();
        let timed = TimeoutStore::new(Arc::new(store), Duration::from_millis(200));
        let key = StoreKey::activity("u1");
        timed.push_bounded(&key, "x".into(), 10, None).await.unwrap();
        assert_eq!(timed.recent(&key, 10).await.unwrap(), vec!["x"]);
        timed.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = UnavailableStore;
        assert!(matches!(
            store.get(&StoreKey::activity("u1")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.ping().await.is_err());
    }
}
