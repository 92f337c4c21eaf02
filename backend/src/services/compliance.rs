//! Compliance Service
//!
//! Combines rate-limit headroom, activity patterns and violation history into
//! a single 0-100 compliance score, and owns the per-user violation log.
//!
//! Status reads never fail on missing or corrupted history: each input that
//! cannot be read falls back to a neutral sub-score and the status is marked
//! incomplete. Recording a violation, on the other hand, must not be lost and
//! propagates store failures.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::activity_log::{ACTIVITY_LOG_MAX, ActivityLog};
use super::clock::Clock;
use super::pattern_analyzer::{PatternAnalyzer, clamp_score};
use super::rate_limiter::RateLimiterService;
use super::store::{RecordKind, SafetyStore, StoreKey};
use crate::error::SafetyError;
use crate::models::{
    ComplianceLevel, ComplianceReport, ComplianceStatus, RiskFactorCount, StatusBreakdown,
    SubScores, ViolationDetails, ViolationRecord, ViolationType, validate_user_id,
};

/// Stable risk factor identifiers, aggregated in the compliance report
pub mod risk {
    pub const HIGH_WINDOW_USAGE: &str = "high_window_usage";
    pub const ROBOTIC_TIMING: &str = "robotic_timing";
    pub const BURST_ACTIVITY: &str = "burst_activity";
    pub const RAPID_INCREASE: &str = "rapid_increase";
    pub const RECENT_VIOLATIONS: &str = "recent_violations";
}

#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    pub headroom_weight: f64,
    pub timing_weight: f64,
    pub velocity_weight: f64,
    pub history_weight: f64,
    /// Usage ratio of the fullest window that counts as a risk factor
    pub high_usage_ratio: f64,
    /// Violations older than this do not affect the history sub-score
    pub history_window_days: i64,
    pub violation_log_max: usize,
    pub violation_retention_days: i64,
    pub report_top_risk_factors: usize,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            headroom_weight: 0.30,
            timing_weight: 0.25,
            velocity_weight: 0.20,
            history_weight: 0.25,
            high_usage_ratio: 0.8,
            history_window_days: 7,
            violation_log_max: 100,
            violation_retention_days: 90,
            report_top_risk_factors: 5,
        }
    }
}

pub struct ComplianceService {
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<RateLimiterService>,
    activity: ActivityLog,
    analyzer: PatternAnalyzer,
    config: ComplianceConfig,
}

impl ComplianceService {
    pub fn new(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        rate_limiter: Arc<RateLimiterService>,
        analyzer: PatternAnalyzer,
        config: ComplianceConfig,
    ) -> Self {
        Self {
            activity: ActivityLog::new(store.clone(), clock.clone()),
            store,
            clock,
            rate_limiter,
            analyzer,
            config,
        }
    }

    /// Best-effort compliance status. Only an invalid user id is an error.
    pub async fn get_compliance_status(&self, user_id: &str) -> Result<ComplianceStatus, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let mut sub_scores = SubScores::default();
        let mut risk_factors = Vec::new();
        let mut recommendations = Vec::new();
        let mut data_complete = true;

        // Window headroom
        match self.rate_limiter.max_usage_ratio(user_id).await {
            Ok(ratio) => {
                sub_scores.window_headroom = clamp_score(100.0 * (1.0 - ratio));
                if ratio >= self.config.high_usage_ratio {
                    risk_factors.push(risk::HIGH_WINDOW_USAGE.to_string());
                    recommendations
                        .push("Spread remaining actions over later windows".to_string());
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Usage unavailable, using default headroom");
                data_complete = false;
            }
        }

        // Timing regularity and velocity
        match self.activity.recent(user_id, ACTIVITY_LOG_MAX).await {
            Ok(entries) => {
                let analysis = self.analyzer.analyze(&entries, now);
                sub_scores.timing_regularity = analysis.timing.score;
                sub_scores.velocity = analysis.velocity.score;

                if analysis.timing.robotic {
                    risk_factors.push(risk::ROBOTIC_TIMING.to_string());
                    recommendations.push("Randomise delays between actions".to_string());
                }
                if analysis.timing.bursty {
                    risk_factors.push(risk::BURST_ACTIVITY.to_string());
                    recommendations.push("Avoid performing actions in quick bursts".to_string());
                }
                if analysis.velocity.rapid_increase {
                    risk_factors.push(risk::RAPID_INCREASE.to_string());
                    recommendations
                        .push("Ramp up daily volume gradually over several days".to_string());
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Activity unavailable, using default pattern scores");
                data_complete = false;
            }
        }

        // Compliance history
        match self.recent_violations(user_id, self.config.violation_log_max).await {
            Ok(violations) => {
                let since = now - Duration::days(self.config.history_window_days);
                let recent: Vec<&ViolationRecord> =
                    violations.iter().filter(|v| v.timestamp >= since).collect();
                let penalty: f64 = recent.iter().map(|v| v.severity.weight()).sum();
                sub_scores.compliance_history = clamp_score(100.0 - penalty);

                if !recent.is_empty() {
                    risk_factors.push(risk::RECENT_VIOLATIONS.to_string());
                    recommendations
                        .push("Review recent violations before increasing activity".to_string());
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Violations unavailable, using default history score");
                data_complete = false;
            }
        }

        let score = self.composite(&sub_scores);
        let status = ComplianceLevel::from_score(score);

        if status != ComplianceLevel::Compliant && recommendations.is_empty() {
            recommendations.push("Reduce automation volume until the score recovers".to_string());
        }

        debug!(user_id = %user_id, score, ?status, "Computed compliance status");

        Ok(ComplianceStatus {
            user_id: user_id.to_string(),
            score,
            status,
            risk_factors,
            recommendations,
            next_allowed_action: next_allowed_action(status, score, now),
            sub_scores,
            data_complete,
        })
    }

    /// Append a violation to the user's log. Store failures propagate.
    pub async fn record_violation(
        &self,
        user_id: &str,
        violation_type: ViolationType,
        details: ViolationDetails,
    ) -> Result<ViolationRecord, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let record = ViolationRecord {
            user_id: user_id.to_string(),
            violation_type,
            severity: details
                .severity
                .unwrap_or_else(|| violation_type.default_severity()),
            timestamp: now,
            metadata: details.metadata,
        };

        let value = serde_json::to_string(&record)
            .map_err(|e| SafetyError::Validation(format!("unserializable metadata: {e}")))?;

        self.store
            .push_bounded(
                &StoreKey::violations(user_id),
                value,
                self.config.violation_log_max,
                Some(now + Duration::days(self.config.violation_retention_days)),
            )
            .await?;

        warn!(
            user_id = %user_id,
            violation_type = violation_type.as_str(),
            severity = %record.severity,
            "Recorded compliance violation"
        );

        Ok(record)
    }

    /// Newest-first violations; corrupted entries are skipped
    pub async fn recent_violations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ViolationRecord>, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let raw = self.store.recent(&StoreKey::violations(user_id), limit).await?;
        Ok(raw
            .into_iter()
            .filter_map(|line| match serde_json::from_str(&line) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(user_id = %user_id, error = %e, "Skipping corrupted violation entry");
                    None
                }
            })
            .collect())
    }

    /// Aggregate status over every user with activity or violations on record.
    ///
    /// Only a failure to enumerate users propagates.
    pub async fn get_compliance_report(&self) -> Result<ComplianceReport, SafetyError> {
        let mut users = BTreeSet::new();
        for kind in [RecordKind::Activity, RecordKind::Violations] {
            for key in self.store.keys(kind).await? {
                if !key.is_global() {
                    users.insert(key.user);
                }
            }
        }

        let mut breakdown = StatusBreakdown::default();
        let mut total_score = 0.0;
        let mut scored = 0usize;
        let mut factor_counts: HashMap<String, usize> = HashMap::new();

        for user_id in &users {
            let status = match self.get_compliance_status(user_id).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(user_id = %user_id, error = %e, "Skipping user in compliance report");
                    continue;
                }
            };

            match status.status {
                ComplianceLevel::Compliant => breakdown.compliant += 1,
                ComplianceLevel::Warning => breakdown.warning += 1,
                ComplianceLevel::Violation => breakdown.violation += 1,
            }
            total_score += status.score;
            scored += 1;
            for factor in status.risk_factors {
                *factor_counts.entry(factor).or_default() += 1;
            }
        }

        let mut top_risk_factors: Vec<RiskFactorCount> = factor_counts
            .into_iter()
            .map(|(factor, count)| RiskFactorCount { factor, count })
            .collect();
        top_risk_factors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.factor.cmp(&b.factor)));
        top_risk_factors.truncate(self.config.report_top_risk_factors);

        let average_score = if scored == 0 {
            0.0
        } else {
            round1(total_score / scored as f64)
        };

        Ok(ComplianceReport {
            total_users: scored,
            status_breakdown: breakdown,
            average_score,
            top_risk_factors,
            generated_at: self.clock.now(),
        })
    }

    fn composite(&self, s: &SubScores) -> f64 {
        let weighted = s.window_headroom * self.config.headroom_weight
            + s.timing_regularity * self.config.timing_weight
            + s.velocity * self.config.velocity_weight
            + s.compliance_history * self.config.history_weight;
        round1(clamp_score(weighted))
    }
}

/// "Now" when compliant; otherwise a cooldown that grows as the score drops
pub fn next_allowed_action(
    status: ComplianceLevel,
    score: f64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match status {
        ComplianceLevel::Compliant => now,
        ComplianceLevel::Warning => {
            let minutes = 15.0 + (80.0 - score).max(0.0);
            now + Duration::minutes(minutes.round() as i64)
        }
        ComplianceLevel::Violation => {
            let minutes = 120.0 + (50.0 - score).max(0.0) * 6.0;
            now + Duration::minutes(minutes.round() as i64)
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, Severity};
    use crate::services::clock::ManualClock;
    use crate::services::rate_limiter::RateLimitConfig;
    use crate::services::store::{InMemoryStore, UnavailableStore};
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        limiter: Arc<RateLimiterService>,
        service: ComplianceService,
    }

    fn setup() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiterService::with_seed(
            store.clone(),
            clock.clone(),
            RateLimitConfig::default(),
            3,
        ));
        let service = ComplianceService::new(
            store.clone(),
            clock.clone(),
            limiter.clone(),
            PatternAnalyzer::default(),
            ComplianceConfig::default(),
        );
        Fixture {
            clock,
            store,
            limiter,
            service,
        }
    }

    #[tokio::test]
    async fn test_new_user_is_compliant() {
        let f = setup();
        let status = f.service.get_compliance_status("u1").await.unwrap();
        assert_eq!(status.score, 100.0);
        assert_eq!(status.status, ComplianceLevel::Compliant);
        assert!(status.risk_factors.is_empty());
        assert_eq!(status.next_allowed_action, f.clock.now());
        assert!(status.data_complete);
    }

    #[tokio::test]
    async fn test_steady_volume_at_daily_cap_is_not_an_increase() {
        let f = setup();
        let log = ActivityLog::new(f.store.clone(), f.clock.clone());
        let today_start = Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap();

        // 100 actions a day, every day of the baseline and today
        for days_ago in (0..=7).rev() {
            let day_start = today_start - Duration::days(days_ago);
            for i in 0..100 {
                let entry = crate::models::ActivityEntry {
                    action: ActionType::ProfileView,
                    success: true,
                    at: day_start + Duration::minutes(10 + 5 * i),
                };
                log.append("u1", &entry).await.unwrap();
            }
        }

        let status = f.service.get_compliance_status("u1").await.unwrap();
        assert_eq!(status.sub_scores.velocity, 100.0);
        assert!(!status.risk_factors.contains(&risk::RAPID_INCREASE.to_string()));
    }

    #[tokio::test]
    async fn test_violations_lower_the_score() {
        let f = setup();
        for _ in 0..3 {
            f.service
                .record_violation(
                    "u1",
                    ViolationType::PlatformWarning,
                    ViolationDetails::default(),
                )
                .await
                .unwrap();
        }

        let status = f.service.get_compliance_status("u1").await.unwrap();
        // History: 100 - 3 * 20 = 40, weighted 0.25
        assert_eq!(status.sub_scores.compliance_history, 40.0);
        assert_eq!(status.score, 85.0);
        assert!(status.risk_factors.contains(&risk::RECENT_VIOLATIONS.to_string()));

        // Violations age out of the history window
        f.clock.advance(Duration::days(8));
        let status = f.service.get_compliance_status("u1").await.unwrap();
        assert_eq!(status.sub_scores.compliance_history, 100.0);
    }

    #[tokio::test]
    async fn test_combined_pressure_reaches_violation() {
        let f = setup();
        // Robotic cadence filling the hourly like window
        for _ in 0..8 {
            f.limiter.record_request("u1", ActionType::Like, true).await.unwrap();
            f.clock.advance(Duration::seconds(30));
        }
        for _ in 0..3 {
            f.service
                .record_violation(
                    "u1",
                    ViolationType::AccountRestriction,
                    ViolationDetails::default(),
                )
                .await
                .unwrap();
        }

        let status = f.service.get_compliance_status("u1").await.unwrap();
        assert_eq!(status.sub_scores.window_headroom, 0.0);
        assert_eq!(status.sub_scores.compliance_history, 0.0);
        assert!(status.sub_scores.timing_regularity < 50.0);
        assert_eq!(status.status, ComplianceLevel::Violation);
        assert!(status.next_allowed_action >= f.clock.now() + Duration::hours(2));
        assert!(!status.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_severity_override() {
        let f = setup();
        let record = f
            .service
            .record_violation(
                "u1",
                ViolationType::RateLimitExceeded,
                ViolationDetails {
                    severity: Some(Severity::Critical),
                    metadata: serde_json::json!({"action": "invitation"}),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.severity, Severity::Critical);

        let violations = f.service.recent_violations("u1", 10).await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].metadata["action"], "invitation");
    }

    #[tokio::test]
    async fn test_corrupted_history_is_skipped() {
        let f = setup();
        f.store
            .push_bounded(&StoreKey::violations("u1"), "garbage".into(), 100, None)
            .await
            .unwrap();
        f.store
            .push_bounded(&StoreKey::activity("u1"), "{\"bad\":1}".into(), 100, None)
            .await
            .unwrap();

        let status = f.service.get_compliance_status("u1").await.unwrap();
        assert_eq!(status.score, 100.0);
        assert!(status.data_complete);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_status_but_fails_violation_write() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn SafetyStore> = Arc::new(UnavailableStore);
        let limiter = Arc::new(RateLimiterService::with_seed(
            store.clone(),
            clock.clone(),
            RateLimitConfig::default(),
            3,
        ));
        let service = ComplianceService::new(
            store,
            clock,
            limiter,
            PatternAnalyzer::default(),
            ComplianceConfig::default(),
        );

        let status = service.get_compliance_status("u1").await.unwrap();
        assert!(!status.data_complete);
        assert_eq!(status.status, ComplianceLevel::Compliant);

        let result = service
            .record_violation("u1", ViolationType::PlatformWarning, ViolationDetails::default())
            .await;
        assert!(matches!(result, Err(SafetyError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_violation_log_is_bounded() {
        let f = setup();
        for _ in 0..105 {
            f.service
                .record_violation("u1", ViolationType::SuspiciousPattern, ViolationDetails::default())
                .await
                .unwrap();
        }
        assert_eq!(f.service.recent_violations("u1", 500).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_report() {
        let f = setup();
        let empty = f.service.get_compliance_report().await.unwrap();
        assert_eq!(empty.total_users, 0);
        assert_eq!(empty.average_score, 0.0);

        f.limiter.record_request("good", ActionType::ProfileView, true).await.unwrap();
        for _ in 0..3 {
            f.service
                .record_violation("bad", ViolationType::PlatformWarning, ViolationDetails::default())
                .await
                .unwrap();
        }

        let report = f.service.get_compliance_report().await.unwrap();
        assert_eq!(report.total_users, 2);
        assert_eq!(report.status_breakdown.compliant, 2);
        assert_eq!(report.top_risk_factors[0].factor, risk::RECENT_VIOLATIONS);
        assert!(report.average_score > 80.0 && report.average_score < 100.0);
    }

    #[test]
    fn test_next_allowed_action_scales_with_severity() {
        let now = Utc::now();
        assert_eq!(next_allowed_action(ComplianceLevel::Compliant, 95.0, now), now);
        assert_eq!(
            next_allowed_action(ComplianceLevel::Warning, 70.0, now),
            now + Duration::minutes(25)
        );
        assert_eq!(
            next_allowed_action(ComplianceLevel::Violation, 40.0, now),
            now + Duration::minutes(180)
        );
    }
}
