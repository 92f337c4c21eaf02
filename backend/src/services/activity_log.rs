//! Recent activity log
//!
//! Bounded per-user log of recorded actions (consumed by the pattern
//! analyzer and the resume safety check) plus the fleet-wide outcome log the
//! rate limiter recalibrates against.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use super::clock::Clock;
use super::rate_limiter::GLOBAL_LIMIT;
use super::store::{SafetyStore, StoreError, StoreKey};
use crate::models::{ActivityEntry, OutcomeEntry};

/// Enough history for a 7-day velocity baseline plus today
pub const ACTIVITY_RETENTION_DAYS: i64 = 8;
/// Entries kept per user: every retained day at the default global daily cap
pub const ACTIVITY_LOG_MAX: usize = ACTIVITY_RETENTION_DAYS as usize * GLOBAL_LIMIT.daily as usize;
/// Fleet-wide outcomes kept for limit recalibration
pub const OUTCOME_LOG_MAX: usize = 100;

#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn SafetyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append an entry to the user's log and the fleet outcome log
    pub async fn append(&self, user_id: &str, entry: &ActivityEntry) -> Result<(), StoreError> {
        let expires_at = Some(self.clock.now() + Duration::days(ACTIVITY_RETENTION_DAYS));

        self.store
            .push_bounded(
                &StoreKey::activity(user_id),
                encode(entry),
                ACTIVITY_LOG_MAX,
                expires_at,
            )
            .await?;

        let outcome = OutcomeEntry {
            success: entry.success,
            at: entry.at,
        };
        self.store
            .push_bounded(&StoreKey::outcomes(), encode(&outcome), OUTCOME_LOG_MAX, None)
            .await
    }

    /// Newest-first entries; corrupted entries are skipped
    pub async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        let raw = self.store.recent(&StoreKey::activity(user_id), limit).await?;
        Ok(decode_all(user_id, raw))
    }

    /// Newest-first fleet outcomes; corrupted entries are skipped
    pub async fn recent_outcomes(&self, limit: usize) -> Result<Vec<OutcomeEntry>, StoreError> {
        let raw = self.store.recent(&StoreKey::outcomes(), limit).await?;
        Ok(decode_all("<fleet>", raw))
    }
}

/// Share of failed entries, `None` when there are no entries
pub fn failure_rate<I>(outcomes: I) -> Option<f64>
where
    I: IntoIterator<Item = bool>,
{
    let (total, failures) = outcomes
        .into_iter()
        .fold((0usize, 0usize), |(total, failures), success| {
            (total + 1, failures + usize::from(!success))
        });

    (total > 0).then(|| failures as f64 / total as f64)
}

fn encode<T: serde::Serialize>(value: &T) -> String {
    // Serializing these plain structs cannot fail
    serde_json::to_string(value).unwrap_or_default()
}

fn decode_all<T: serde::de::DeserializeOwned>(owner: &str, raw: Vec<String>) -> Vec<T> {
    raw.into_iter()
        .filter_map(|line| match serde_json::from_str(&line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(user_id = %owner, error = %e, "Skipping corrupted log entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionType;
    use crate::services::clock::ManualClock;
    use crate::services::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_append_and_read_back() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let log = ActivityLog::new(store.clone(), clock.clone());

        for success in [true, false, true] {
            let entry = ActivityEntry {
                action: ActionType::Like,
                success,
                at: clock.now(),
            };
            log.append("u1", &entry).await.unwrap();
        }

        // A corrupted line is skipped rather than failing the read
        store
            .push_bounded(&StoreKey::activity("u1"), "{not json".into(), 10, None)
            .await
            .unwrap();

        let entries = log.recent("u1", 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].success);
        assert!(!entries[1].success);

        let outcomes = log.recent_outcomes(10).await.unwrap();
        assert_eq!(outcomes.len(), 3);
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(failure_rate(Vec::<bool>::new()), None);
        assert_eq!(failure_rate([true, true]), Some(0.0));
        assert_eq!(failure_rate([true, false, false, true]), Some(0.5));
    }
}
