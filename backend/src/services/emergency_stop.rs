//! Emergency Stop Service
//!
//! Top-level kill-switch. A stored `EmergencyStopRecord` suspends all
//! automation for a user until it is resumed, either automatically once its
//! resume time passes or by a human when manual resume is required.
//!
//! Triggering is a safety-critical write and propagates store failures.
//! Status reads fail open. Resumption, from whichever path runs it, deletes
//! the record with a conditional delete so only one caller performs the
//! resume side effects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::activity_log::{ActivityLog, failure_rate};
use super::circuit_breaker::CircuitBreakerService;
use super::clock::Clock;
use super::notifier::{Notifier, SafetyNotification};
use super::store::{RecordKind, SafetyStore, StoreKey};
use crate::error::{ConflictReason, SafetyError};
use crate::models::{
    EmergencyStopDashboard, EmergencyStopRecord, FailedStop, MaintenanceReport, ResumeAuditEntry,
    ResumeOutcome, Severity, StopIndexEntry, StopReason, StopType, SystemWideStopResult,
    validate_user_id,
};

/// Actor names that identify automation rather than a person
pub const AUTOMATED_ACTORS: [&str; 5] = ["system", "scheduler", "maintenance", "automation", "circuit-breaker"];

#[derive(Debug, Clone)]
pub struct EmergencyStopConfig {
    /// Added to the auto-resume delay to get the record TTL. Must outlast
    /// the maintenance interval: the record expiring on its own skips the
    /// resume side effects.
    pub resume_buffer: Duration,
    /// Record TTL when a human must resume
    pub manual_stop_ttl: Duration,
    /// Resume is refused above this recent failure rate
    pub resume_failure_rate_threshold: f64,
    /// Recent actions inspected by the resume safety check
    pub resume_check_sample: usize,
    /// Fewer actions than this skips the safety check
    pub resume_check_min_samples: usize,
    /// Expired auto-resumable stops are resumed by the status read itself
    pub lazy_resume_on_read: bool,
    pub dashboard_recent_limit: usize,
    pub user_log_max: usize,
    pub user_log_retention: Duration,
    /// Index entries older than this are pruned by maintenance
    pub index_retention: Duration,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            resume_buffer: Duration::days(7),
            manual_stop_ttl: Duration::days(7),
            resume_failure_rate_threshold: 0.6,
            resume_check_sample: 20,
            resume_check_min_samples: 5,
            lazy_resume_on_read: true,
            dashboard_recent_limit: 20,
            user_log_max: 50,
            user_log_retention: Duration::days(90),
            index_retention: Duration::days(30),
        }
    }
}

/// Whether `actor` names automation rather than a person (`system`, `scheduler:nightly`, ...)
pub fn is_automated_actor(actor: &str) -> bool {
    let actor = actor.trim().to_ascii_lowercase();
    AUTOMATED_ACTORS.iter().any(|name| {
        actor == *name
            || actor
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with(':'))
    })
}

pub struct EmergencyStopService {
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    breakers: Arc<CircuitBreakerService>,
    activity: ActivityLog,
    config: EmergencyStopConfig,
}

impl EmergencyStopService {
    pub fn new(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        breakers: Arc<CircuitBreakerService>,
        config: EmergencyStopConfig,
    ) -> Self {
        Self {
            activity: ActivityLog::new(store.clone(), clock.clone()),
            store,
            clock,
            notifier,
            breakers,
            config,
        }
    }

    pub fn config(&self) -> &EmergencyStopConfig {
        &self.config
    }

    /// Suspend automation for a user.
    ///
    /// Re-triggering an active stop merges it with the stored one. The
    /// returned record carries the merged values, which can differ from the
    /// caller's reason:
    ///
    /// - `reason.severity` is the higher of the two severities
    /// - `manual_resume_required` stays set once either stop required it
    /// - `estimated_resume_time` is the later deadline, or none when manual
    ///
    /// Reason type, description, metadata, `triggered_by` and `triggered_at`
    /// always come from this call.
    pub async fn trigger_emergency_stop(
        &self,
        user_id: &str,
        reason: StopReason,
        triggered_by: &str,
    ) -> Result<EmergencyStopRecord, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;
        validate_reason(&reason, triggered_by)?;

        let now = self.clock.now();
        let key = StoreKey::emergency_stop(user_id);

        let existing = self
            .store
            .get(&key)
            .await?
            .map(|raw| self.parse_record(user_id, &raw));

        let mut record = EmergencyStopRecord {
            user_id: user_id.to_string(),
            active: true,
            manual_resume_required: reason.auto_resume_after_minutes.is_none(),
            estimated_resume_time: reason
                .auto_resume_after_minutes
                .map(|minutes| now + Duration::minutes(i64::from(minutes))),
            reason,
            triggered_at: now,
            triggered_by: triggered_by.to_string(),
        };

        if let Some(existing) = existing {
            record.reason.severity = record.reason.severity.max(existing.reason.severity);
            record.manual_resume_required |= existing.manual_resume_required;
            record.estimated_resume_time = match (existing.estimated_resume_time, record.estimated_resume_time) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        if record.manual_resume_required {
            record.estimated_resume_time = None;
        }

        let expires_at = match record.estimated_resume_time {
            Some(resume_at) => resume_at + self.config.resume_buffer,
            None => now + self.config.manual_stop_ttl,
        };

        self.store
            .set(&key, encode(&record), Some(expires_at))
            .await?;

        warn!(
            user_id = %user_id,
            reason_type = %record.reason.reason_type,
            severity = %record.reason.severity,
            triggered_by = %triggered_by,
            manual_resume_required = record.manual_resume_required,
            "Emergency stop triggered"
        );

        let entry = encode(&StopIndexEntry::from(&record));
        if let Err(e) = self
            .store
            .index_add(&StoreKey::stop_index(), now.timestamp_millis(), entry.clone())
            .await
        {
            error!(user_id = %user_id, error = %e, "Failed to index emergency stop");
        }
        if let Err(e) = self
            .store
            .push_bounded(
                &StoreKey::stop_log(user_id),
                entry,
                self.config.user_log_max,
                Some(now + self.config.user_log_retention),
            )
            .await
        {
            error!(user_id = %user_id, error = %e, "Failed to append to stop log");
        }

        self.notify(SafetyNotification::stop_triggered(&record)).await;

        Ok(record)
    }

    /// Active stop for a user, or `None`.
    ///
    /// Fails open on an unreachable store. A corrupted record reads as a
    /// manual-resume stop. An expired auto-resumable stop reads as `None`;
    /// with lazy resume enabled this call also performs the resume.
    pub async fn get_emergency_stop_status(&self, user_id: &str) -> Option<EmergencyStopRecord> {
        validate_user_id(user_id).ok()?;

        let key = StoreKey::emergency_stop(user_id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Emergency stop state unavailable, failing open");
                return None;
            }
        };

        let record = self.parse_record(user_id, &raw);
        let now = self.clock.now();

        if !record.is_auto_resumable(now) {
            return Some(record);
        }

        if self.config.lazy_resume_on_read {
            if let Err(e) = self.auto_resume(user_id, &raw, &record, "system").await {
                warn!(user_id = %user_id, error = %e, "Lazy auto-resume failed");
            }
        }
        None
    }

    /// Lift a stop on behalf of `requested_by`.
    pub async fn resume_automation(
        &self,
        user_id: &str,
        requested_by: &str,
        notes: Option<&str>,
    ) -> Result<ResumeOutcome, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;
        if requested_by.trim().is_empty() {
            return Err(SafetyError::Validation("requestedBy must not be empty".to_string()));
        }

        let key = StoreKey::emergency_stop(user_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| SafetyError::conflict(user_id, ConflictReason::NoActiveStop))?;
        let record = self.parse_record(user_id, &raw);

        if record.manual_resume_required && is_automated_actor(requested_by) {
            info!(
                user_id = %user_id,
                requested_by = %requested_by,
                "Automated resume refused: manual resume required"
            );
            return Err(SafetyError::conflict(user_id, ConflictReason::ManualResumeRequired));
        }

        self.check_recent_failure_rate(user_id).await?;

        if !self.store.delete_if_equals(&key, &raw).await? {
            let reason = match self.store.get(&key).await? {
                None => ConflictReason::NoActiveStop,
                Some(_) => ConflictReason::ConcurrentModification,
            };
            return Err(SafetyError::conflict(user_id, reason));
        }

        let breakers_reset = self.finish_resume(user_id, &record, requested_by, notes, false).await;

        Ok(ResumeOutcome {
            user_id: user_id.to_string(),
            resumed_at: self.clock.now(),
            breakers_reset,
            message: format!("Automation resumed by {requested_by}"),
        })
    }

    /// Stop every listed user independently.
    ///
    /// Per-user failures are counted, not fatal. One fleet notification is
    /// published after the batch.
    pub async fn trigger_system_wide_emergency_stop(
        &self,
        reason: StopReason,
        triggered_by: &str,
        affected_users: &[String],
    ) -> Result<SystemWideStopResult, SafetyError> {
        validate_reason(&reason, triggered_by)?;

        let users: BTreeSet<&str> = affected_users.iter().map(String::as_str).collect();
        let triggered_at = self.clock.now();
        let mut succeeded = 0;
        let mut failed = Vec::new();

        for user_id in &users {
            match self
                .trigger_emergency_stop(user_id, reason.clone(), triggered_by)
                .await
            {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "System-wide stop failed for user");
                    failed.push(FailedStop {
                        user_id: user_id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let result = SystemWideStopResult {
            affected_users: users.len(),
            succeeded,
            failed,
            triggered_at,
        };

        warn!(
            affected_users = result.affected_users,
            succeeded = result.succeeded,
            failed = result.failed.len(),
            triggered_by = %triggered_by,
            "System-wide emergency stop"
        );
        self.notify(SafetyNotification::fleet_stop(&reason, triggered_by, &result))
            .await;

        Ok(result)
    }

    /// Population-wide view of active stops and breaker states.
    ///
    /// Corrupted records are counted in `skipped_records`; only an
    /// unreachable store is an error.
    pub async fn get_emergency_stop_dashboard(&self) -> Result<EmergencyStopDashboard, SafetyError> {
        let now = self.clock.now();
        let keys = self.store.keys(RecordKind::EmergencyStop).await?;
        let values = self.store.get_many(&keys).await?;

        let mut active_stops = 0;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut manual_resume_pending = 0;
        let mut skipped_records = 0;

        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            let record = match serde_json::from_str::<EmergencyStopRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    debug!(key = %key, error = %e, "Skipping corrupted emergency stop");
                    skipped_records += 1;
                    continue;
                }
            };
            if record.is_auto_resumable(now) {
                continue;
            }

            active_stops += 1;
            *by_type.entry(record.reason.reason_type.to_string()).or_default() += 1;
            *by_severity.entry(record.reason.severity.to_string()).or_default() += 1;
            if record.manual_resume_required {
                manual_resume_pending += 1;
            }
        }

        let recent_stops = self.recent_stops(self.config.dashboard_recent_limit).await?;
        let census = self.breakers.state_counts().await?;

        Ok(EmergencyStopDashboard {
            active_stops,
            by_type,
            by_severity,
            manual_resume_pending,
            recent_stops,
            breaker_states: census.counts,
            skipped_records: skipped_records + census.skipped,
            generated_at: now,
        })
    }

    /// Periodic sweep: resume expired auto-resumable stops, drop stale
    /// breakers, prune the stop index and purge expired records.
    pub async fn perform_maintenance_tasks(&self) -> Result<MaintenanceReport, SafetyError> {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        let keys = self.store.keys(RecordKind::EmergencyStop).await?;
        let values = self.store.get_many(&keys).await?;

        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            let Ok(record) = serde_json::from_str::<EmergencyStopRecord>(&raw) else {
                continue;
            };
            if !record.is_auto_resumable(now) {
                continue;
            }
            match self.auto_resume(&key.user, &raw, &record, "maintenance").await {
                Ok(true) => report.auto_resumed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(user_id = %key.user, error = %e, "Auto-resume failed during maintenance");
                    report.errors += 1;
                }
            }
        }

        match self.breakers.cleanup_stale().await {
            Ok(removed) => report.breakers_removed = removed,
            Err(e) => {
                warn!(error = %e, "Breaker cleanup failed");
                report.errors += 1;
            }
        }

        let cutoff = (now - self.config.index_retention).timestamp_millis();
        match self.store.index_remove_below(&StoreKey::stop_index(), cutoff).await {
            Ok(pruned) => report.index_entries_pruned = pruned,
            Err(e) => {
                warn!(error = %e, "Stop index pruning failed");
                report.errors += 1;
            }
        }

        match self.store.purge_expired().await {
            Ok(purged) => report.records_purged = purged,
            Err(e) => {
                warn!(error = %e, "Expired record purge failed");
                report.errors += 1;
            }
        }

        if report.auto_resumed > 0 || report.breakers_removed > 0 {
            info!(
                auto_resumed = report.auto_resumed,
                breakers_removed = report.breakers_removed,
                index_entries_pruned = report.index_entries_pruned,
                records_purged = report.records_purged,
                "Safety maintenance completed"
            );
        }

        Ok(report)
    }

    /// Most recent stops fleet-wide, newest first
    pub async fn recent_stops(&self, limit: usize) -> Result<Vec<StopIndexEntry>, SafetyError> {
        let raw = self.store.index_recent(&StoreKey::stop_index(), limit).await?;
        Ok(decode_all(raw))
    }

    /// A user's stop history, newest first
    pub async fn user_history(&self, user_id: &str, limit: usize) -> Result<Vec<StopIndexEntry>, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;
        let raw = self.store.recent(&StoreKey::stop_log(user_id), limit).await?;
        Ok(decode_all(raw))
    }

    /// Who resumed a user's automation and when, newest first
    pub async fn resume_history(&self, user_id: &str, limit: usize) -> Result<Vec<ResumeAuditEntry>, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;
        let raw = self.store.recent(&StoreKey::resume_log(user_id), limit).await?;
        Ok(decode_all(raw))
    }

    /// Resume an expired stop if `raw` is still the stored value.
    /// Returns whether this caller performed the resume.
    async fn auto_resume(
        &self,
        user_id: &str,
        raw: &str,
        record: &EmergencyStopRecord,
        actor: &str,
    ) -> Result<bool, SafetyError> {
        let key = StoreKey::emergency_stop(user_id);
        if !self.store.delete_if_equals(&key, raw).await? {
            return Ok(false);
        }
        self.finish_resume(user_id, record, actor, None, true).await;
        Ok(true)
    }

    /// Side effects after the stop record was removed
    async fn finish_resume(
        &self,
        user_id: &str,
        record: &EmergencyStopRecord,
        requested_by: &str,
        notes: Option<&str>,
        automatic: bool,
    ) -> usize {
        let now = self.clock.now();

        let breakers_reset = match self.breakers.close_user_breakers(user_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to reset breakers on resume");
                0
            }
        };

        let audit = ResumeAuditEntry {
            user_id: user_id.to_string(),
            requested_by: requested_by.to_string(),
            notes: notes.map(str::to_string),
            resumed_at: now,
            automatic,
            stop_type: record.reason.reason_type,
            stopped_at: record.triggered_at,
        };
        if let Err(e) = self
            .store
            .push_bounded(
                &StoreKey::resume_log(user_id),
                encode(&audit),
                self.config.user_log_max,
                Some(now + self.config.user_log_retention),
            )
            .await
        {
            error!(user_id = %user_id, error = %e, "Failed to record resume attribution");
        }

        info!(
            user_id = %user_id,
            requested_by = %requested_by,
            automatic,
            breakers_reset,
            "Automation resumed"
        );
        self.notify(SafetyNotification::stop_resumed(user_id, requested_by, automatic, now))
            .await;

        breakers_reset
    }

    async fn check_recent_failure_rate(&self, user_id: &str) -> Result<(), SafetyError> {
        let recent = self
            .activity
            .recent(user_id, self.config.resume_check_sample)
            .await?;
        if recent.len() < self.config.resume_check_min_samples {
            return Ok(());
        }

        let rate = failure_rate(recent.iter().map(|e| e.success)).unwrap_or(0.0);
        if rate > self.config.resume_failure_rate_threshold {
            warn!(
                user_id = %user_id,
                failure_rate = rate,
                "Resume refused by safety check"
            );
            return Err(SafetyError::SafetyCheckFailure {
                failure_rate: rate,
                threshold: self.config.resume_failure_rate_threshold,
            });
        }
        Ok(())
    }

    /// Parse a stored stop; an unparseable one becomes a manual-resume stop
    fn parse_record(&self, user_id: &str, raw: &str) -> EmergencyStopRecord {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(user_id = %user_id, error = %e, "Corrupted emergency stop record, treating as manual stop");
            EmergencyStopRecord {
                user_id: user_id.to_string(),
                active: true,
                reason: StopReason::new(
                    StopType::Unknown,
                    Severity::Critical,
                    "stored emergency stop could not be read",
                ),
                triggered_at: self.clock.now(),
                triggered_by: "unknown".to_string(),
                manual_resume_required: true,
                estimated_resume_time: None,
            }
        })
    }

    async fn notify(&self, notification: SafetyNotification) {
        if let Err(e) = self.notifier.publish(notification).await {
            warn!(error = %e, "Failed to publish emergency stop notification");
        }
    }
}

fn validate_reason(reason: &StopReason, triggered_by: &str) -> Result<(), SafetyError> {
    if triggered_by.trim().is_empty() {
        return Err(SafetyError::Validation("triggeredBy must not be empty".to_string()));
    }
    if reason.description.trim().is_empty() {
        return Err(SafetyError::Validation("reason description must not be empty".to_string()));
    }
    if reason.auto_resume_after_minutes == Some(0) {
        return Err(SafetyError::Validation(
            "autoResumeAfterMinutes must be positive or null".to_string(),
        ));
    }
    Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn decode_all<T: serde::de::DeserializeOwned>(raw: Vec<String>) -> Vec<T> {
    raw.iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// When an auto-resumable stop will lift, for display
pub fn resume_eta(record: &EmergencyStopRecord, now: DateTime<Utc>) -> Option<Duration> {
    record
        .estimated_resume_time
        .filter(|_| !record.manual_resume_required)
        .map(|at| (at - now).max(Duration::zero()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionClass, ActionType, ActivityEntry, BreakerState, FailureKind};
    use crate::services::circuit_breaker::CircuitBreakerConfig;
    use crate::services::clock::ManualClock;
    use crate::services::notifier::{NotificationAction, NotificationChannel, RecordingNotifier};
    use crate::services::store::{InMemoryStore, UnavailableStore};
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
        breakers: Arc<CircuitBreakerService>,
        stops: EmergencyStopService,
    }

    fn setup_with(config: EmergencyStopConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let breakers = Arc::new(CircuitBreakerService::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let stops = EmergencyStopService::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            breakers.clone(),
            config,
        );
        Fixture {
            clock,
            store,
            notifier,
            breakers,
            stops,
        }
    }

    fn setup() -> Fixture {
        setup_with(EmergencyStopConfig::default())
    }

    fn critical_manual() -> StopReason {
        StopReason::new(StopType::ComplianceViolation, Severity::Critical, "repeated warnings")
    }

    fn breaker_stop(minutes: u32) -> StopReason {
        StopReason::new(StopType::CircuitBreaker, Severity::High, "breaker reopened").auto_resume_after(minutes)
    }

    #[tokio::test]
    async fn test_trigger_then_status() {
        let f = setup();
        let record = f
            .stops
            .trigger_emergency_stop("u1", critical_manual(), "compliance-monitor")
            .await
            .unwrap();
        assert!(record.manual_resume_required);
        assert_eq!(record.estimated_resume_time, None);

        let status = f.stops.get_emergency_stop_status("u1").await.unwrap();
        assert_eq!(status.reason, critical_manual());
        assert_eq!(
            f.notifier.count(NotificationChannel::EmergencyStop, NotificationAction::Triggered),
            1
        );
        assert_eq!(f.stops.user_history("u1", 10).await.unwrap().len(), 1);
        assert_eq!(f.stops.recent_stops(10).await.unwrap()[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_manual_resume_by_human() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", critical_manual(), "compliance-monitor")
            .await
            .unwrap();

        let outcome = f
            .stops
            .resume_automation("u1", "compliance-officer", Some("reviewed"))
            .await
            .unwrap();
        assert_eq!(outcome.user_id, "u1");
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());

        let audit = f.stops.resume_history("u1", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].requested_by, "compliance-officer");
        assert_eq!(audit[0].notes.as_deref(), Some("reviewed"));
        assert!(!audit[0].automatic);
    }

    #[tokio::test]
    async fn test_automated_actor_cannot_lift_manual_stop() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", critical_manual(), "compliance-monitor")
            .await
            .unwrap();

        for actor in ["system", "SYSTEM", "scheduler:nightly"] {
            let err = f.stops.resume_automation("u1", actor, None).await.unwrap_err();
            assert!(matches!(
                err,
                SafetyError::StateConflict {
                    reason: ConflictReason::ManualResumeRequired,
                    ..
                }
            ));
            assert!(err.to_string().contains("manual resume required"));
        }
        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_resume_without_stop_conflicts() {
        let f = setup();
        let err = f.stops.resume_automation("u1", "ops", None).await.unwrap_err();
        assert!(matches!(
            err,
            SafetyError::StateConflict {
                reason: ConflictReason::NoActiveStop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_safety_check_blocks_resume() {
        let f = setup();
        let activity = ActivityLog::new(f.store.clone(), f.clock.clone());
        for i in 0..10 {
            let entry = ActivityEntry {
                action: ActionType::Message,
                success: i < 3,
                at: f.clock.now(),
            };
            activity.append("u1", &entry).await.unwrap();
        }
        f.stops
            .trigger_emergency_stop("u1", breaker_stop(60), "circuit-breaker")
            .await
            .unwrap();

        let err = f.stops.resume_automation("u1", "ops", None).await.unwrap_err();
        match err {
            SafetyError::SafetyCheckFailure { failure_rate, threshold } => {
                assert!((failure_rate - 0.7).abs() < 1e-9);
                assert_eq!(threshold, 0.6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_lazy_auto_resume_resets_breakers() {
        let f = setup();
        for _ in 0..5 {
            f.breakers
                .record_failure("u1", ActionClass::Connection, FailureKind::Transient)
                .await
                .unwrap();
        }
        let record = f
            .stops
            .trigger_emergency_stop("u1", breaker_stop(30), "circuit-breaker")
            .await
            .unwrap();
        assert!(!record.manual_resume_required);
        assert_eq!(
            record.estimated_resume_time,
            Some(f.clock.now() + Duration::minutes(30))
        );

        f.clock.advance(Duration::minutes(29));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());

        f.clock.advance(Duration::minutes(1));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());

        let breaker = f
            .breakers
            .get_breaker("u1", ActionClass::Connection)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breaker.state, BreakerState::Closed);
        assert_eq!(
            f.notifier.count(NotificationChannel::EmergencyStop, NotificationAction::Resumed),
            1
        );

        // A second read finds nothing and resumes nothing
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());
        assert_eq!(
            f.notifier.count(NotificationChannel::EmergencyStop, NotificationAction::Resumed),
            1
        );
        assert!(f.stops.resume_history("u1", 10).await.unwrap()[0].automatic);
    }

    #[tokio::test]
    async fn test_pure_reads_leave_resume_to_maintenance() {
        let f = setup_with(EmergencyStopConfig {
            lazy_resume_on_read: false,
            ..EmergencyStopConfig::default()
        });
        f.stops
            .trigger_emergency_stop("u1", breaker_stop(10), "circuit-breaker")
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(11));

        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());
        assert!(f.stops.resume_history("u1", 10).await.unwrap().is_empty());

        let report = f.stops.perform_maintenance_tasks().await.unwrap();
        assert_eq!(report.auto_resumed, 1);
        assert_eq!(f.stops.resume_history("u1", 10).await.unwrap().len(), 1);

        let report = f.stops.perform_maintenance_tasks().await.unwrap();
        assert_eq!(report.auto_resumed, 0);
    }

    #[tokio::test]
    async fn test_long_idle_stop_still_resumes_with_side_effects() {
        let f = setup_with(EmergencyStopConfig {
            lazy_resume_on_read: false,
            ..EmergencyStopConfig::default()
        });
        for _ in 0..5 {
            f.breakers
                .record_failure("u1", ActionClass::Connection, FailureKind::Transient)
                .await
                .unwrap();
        }
        f.stops
            .trigger_emergency_stop("u1", breaker_stop(30), "circuit-breaker")
            .await
            .unwrap();

        // Nothing looks at the stop for well over an hour past its resume time
        f.clock.advance(Duration::minutes(120));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());

        let report = f.stops.perform_maintenance_tasks().await.unwrap();
        assert_eq!(report.auto_resumed, 1);

        let breaker = f
            .breakers
            .get_breaker("u1", ActionClass::Connection)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breaker.state, BreakerState::Closed);
        assert_eq!(
            f.notifier.count(NotificationChannel::EmergencyStop, NotificationAction::Resumed),
            1
        );
        assert_eq!(f.stops.resume_history("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retrigger_keeps_manual_and_max_severity() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", critical_manual(), "compliance-monitor")
            .await
            .unwrap();
        let record = f
            .stops
            .trigger_emergency_stop("u1", breaker_stop(30), "circuit-breaker")
            .await
            .unwrap();
        assert!(record.manual_resume_required);
        assert_eq!(record.reason.severity, Severity::Critical);
        assert_eq!(record.estimated_resume_time, None);
        assert_eq!(record.reason.reason_type, StopType::CircuitBreaker);
        assert_eq!(record.reason.description, "breaker reopened");
        assert_eq!(record.triggered_by, "circuit-breaker");

        // What the status read returns is exactly the merged record
        let status = f.stops.get_emergency_stop_status("u1").await.unwrap();
        assert_eq!(status, record);

        f.clock.advance(Duration::hours(2));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_manual_stop_expires_after_seven_days() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", critical_manual(), "ops")
            .await
            .unwrap();
        f.clock.advance(Duration::days(7) - Duration::seconds(1));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());
        f.clock.advance(Duration::seconds(1));
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_record_reads_as_manual_stop() {
        let f = setup();
        f.store
            .set(&StoreKey::emergency_stop("u1"), "][".into(), None)
            .await
            .unwrap();

        let status = f.stops.get_emergency_stop_status("u1").await.unwrap();
        assert_eq!(status.reason.reason_type, StopType::Unknown);
        assert!(status.manual_resume_required);

        assert!(f.stops.resume_automation("u1", "system", None).await.is_err());
        f.stops.resume_automation("u1", "ops-lead", None).await.unwrap();
        assert!(f.stops.get_emergency_stop_status("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_validation() {
        let f = setup();
        assert!(matches!(
            f.stops.trigger_emergency_stop("", critical_manual(), "ops").await,
            Err(SafetyError::Validation(_))
        ));
        assert!(matches!(
            f.stops.trigger_emergency_stop("u1", critical_manual(), " ").await,
            Err(SafetyError::Validation(_))
        ));
        assert!(matches!(
            f.stops.trigger_emergency_stop("u1", breaker_stop(0), "ops").await,
            Err(SafetyError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_fails_closed_but_status_fails_open() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn SafetyStore> = Arc::new(UnavailableStore);
        let notifier = Arc::new(RecordingNotifier::new());
        let breakers = Arc::new(CircuitBreakerService::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let stops = EmergencyStopService::new(
            store,
            clock,
            notifier.clone(),
            breakers,
            EmergencyStopConfig::default(),
        );

        assert!(matches!(
            stops.trigger_emergency_stop("u1", critical_manual(), "ops").await,
            Err(SafetyError::StoreUnavailable(_))
        ));
        assert!(notifier.published().is_empty());
        assert!(stops.get_emergency_stop_status("u1").await.is_none());
        assert!(stops.get_emergency_stop_dashboard().await.is_err());
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_block_trigger() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::failing());
        let breakers = Arc::new(CircuitBreakerService::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let stops = EmergencyStopService::new(store, clock, notifier, breakers, EmergencyStopConfig::default());

        stops
            .trigger_emergency_stop("u1", critical_manual(), "ops")
            .await
            .unwrap();
        assert!(stops.get_emergency_stop_status("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_system_wide_stop_reports_partial_failure() {
        let f = setup();
        let users = vec![
            "u1".to_string(),
            "u2".to_string(),
            "u2".to_string(),
            "bad user".to_string(),
        ];
        let reason = StopReason::new(StopType::SystemWide, Severity::Critical, "platform incident");

        let result = f
            .stops
            .trigger_system_wide_emergency_stop(reason, "ops", &users)
            .await
            .unwrap();
        assert_eq!(result.affected_users, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].user_id, "bad user");

        assert!(f.stops.get_emergency_stop_status("u1").await.is_some());
        assert!(f.stops.get_emergency_stop_status("u2").await.is_some());
        assert_eq!(
            f.notifier.count(NotificationChannel::Fleet, NotificationAction::Triggered),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_dashboard() {
        let f = setup();
        let dashboard = f.stops.get_emergency_stop_dashboard().await.unwrap();
        assert_eq!(dashboard.active_stops, 0);
        assert!(dashboard.by_type.is_empty());
        assert!(dashboard.by_severity.is_empty());
        assert!(dashboard.recent_stops.is_empty());
        assert_eq!(dashboard.breaker_states.total(), 0);
        assert_eq!(dashboard.skipped_records, 0);
    }

    #[tokio::test]
    async fn test_dashboard_aggregates_and_skips_corruption() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", critical_manual(), "ops")
            .await
            .unwrap();
        f.stops
            .trigger_emergency_stop("u2", breaker_stop(60), "circuit-breaker")
            .await
            .unwrap();
        f.store
            .set(&StoreKey::emergency_stop("u3"), "corrupt".into(), None)
            .await
            .unwrap();
        f.breakers
            .record_failure("u2", ActionClass::Messaging, FailureKind::AccountSuspended)
            .await
            .unwrap();

        let dashboard = f.stops.get_emergency_stop_dashboard().await.unwrap();
        assert_eq!(dashboard.active_stops, 2);
        assert_eq!(dashboard.by_type["COMPLIANCE_VIOLATION"], 1);
        assert_eq!(dashboard.by_type["CIRCUIT_BREAKER"], 1);
        assert_eq!(dashboard.by_severity["CRITICAL"], 1);
        assert_eq!(dashboard.by_severity["HIGH"], 1);
        assert_eq!(dashboard.manual_resume_pending, 1);
        assert_eq!(dashboard.recent_stops.len(), 2);
        assert_eq!(dashboard.breaker_states.open, 1);
        assert_eq!(dashboard.skipped_records, 1);
    }

    #[tokio::test]
    async fn test_concurrent_status_reads_resume_once() {
        let f = setup();
        f.stops
            .trigger_emergency_stop("u1", breaker_stop(5), "circuit-breaker")
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(6));

        let stops = Arc::new(f.stops);
        let mut handles = vec![];
        for _ in 0..8 {
            let stops = Arc::clone(&stops);
            handles.push(tokio::spawn(async move {
                stops.get_emergency_stop_status("u1").await
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("Task should not panic").is_none());
        }

        assert_eq!(stops.resume_history("u1", 10).await.unwrap().len(), 1);
        assert_eq!(
            f.notifier.count(NotificationChannel::EmergencyStop, NotificationAction::Resumed),
            1
        );
    }

    #[test]
    fn test_automated_actors() {
        assert!(is_automated_actor("system"));
        assert!(is_automated_actor(" Scheduler "));
        assert!(is_automated_actor("maintenance:sweep"));
        assert!(!is_automated_actor("systems-admin"));
        assert!(!is_automated_actor("compliance-officer"));
    }

    #[test]
    fn test_resume_eta() {
        let now = Utc::now();
        let record = EmergencyStopRecord {
            user_id: "u1".to_string(),
            active: true,
            reason: breaker_stop(10),
            triggered_at: now,
            triggered_by: "circuit-breaker".to_string(),
            manual_resume_required: false,
            estimated_resume_time: Some(now + Duration::minutes(10)),
        };
        assert_eq!(resume_eta(&record, now), Some(Duration::minutes(10)));
        assert_eq!(resume_eta(&record, now + Duration::hours(1)), Some(Duration::zero()));
    }
}
