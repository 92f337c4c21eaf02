//! Emergency stop records
//!
//! The presence of an `EmergencyStopRecord` for a user is the only signal that
//! automation is suspended for that user. Its absence means normal operation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BreakerStateCounts, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopType {
    CircuitBreaker,
    ComplianceViolation,
    AccountSuspension,
    RateLimitAbuse,
    Manual,
    SystemWide,
    /// Substituted when a stored record cannot be parsed
    Unknown,
}

impl StopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::ComplianceViolation => "COMPLIANCE_VIOLATION",
            Self::AccountSuspension => "ACCOUNT_SUSPENSION",
            Self::RateLimitAbuse => "RATE_LIMIT_ABUSE",
            Self::Manual => "MANUAL",
            Self::SystemWide => "SYSTEM_WIDE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for StopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a stop was triggered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReason {
    #[serde(rename = "type")]
    pub reason_type: StopType,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// `None` means a human has to resume automation
    #[serde(default)]
    pub auto_resume_after_minutes: Option<u32>,
}

impl StopReason {
    pub fn new(reason_type: StopType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            reason_type,
            severity,
            description: description.into(),
            metadata: serde_json::Value::Null,
            auto_resume_after_minutes: None,
        }
    }

    pub fn auto_resume_after(mut self, minutes: u32) -> Self {
        self.auto_resume_after_minutes = Some(minutes);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopRecord {
    pub user_id: String,
    pub active: bool,
    pub reason: StopReason,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: String,
    pub manual_resume_required: bool,
    pub estimated_resume_time: Option<DateTime<Utc>>,
}

impl EmergencyStopRecord {
    /// Whether the stop may be lifted automatically at `now`
    pub fn is_auto_resumable(&self, now: DateTime<Utc>) -> bool {
        !self.manual_resume_required
            && self
                .estimated_resume_time
                .is_some_and(|resume_at| resume_at <= now)
    }
}

/// Entry in the global time-ordered stop index and the per-user stop log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopIndexEntry {
    pub user_id: String,
    pub reason_type: StopType,
    pub severity: Severity,
    pub description: String,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: String,
}

impl From<&EmergencyStopRecord> for StopIndexEntry {
    fn from(record: &EmergencyStopRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            reason_type: record.reason.reason_type,
            severity: record.reason.severity,
            description: record.reason.description.clone(),
            triggered_at: record.triggered_at,
            triggered_by: record.triggered_by.clone(),
        }
    }
}

/// Resume attribution log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeAuditEntry {
    pub user_id: String,
    pub requested_by: String,
    pub notes: Option<String>,
    pub resumed_at: DateTime<Utc>,
    pub automatic: bool,
    pub stop_type: StopType,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub user_id: String,
    pub resumed_at: DateTime<Utc>,
    pub breakers_reset: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStop {
    pub user_id: String,
    pub error: String,
}

/// Result of a fleet-wide stop; partial success is reported, never rolled back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemWideStopResult {
    pub affected_users: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedStop>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopDashboard {
    pub active_stops: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub manual_resume_pending: usize,
    pub recent_stops: Vec<StopIndexEntry>,
    pub breaker_states: BreakerStateCounts,
    /// Records that could not be parsed and were left out of the counts
    pub skipped_records: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub auto_resumed: usize,
    pub breakers_removed: usize,
    pub index_entries_pruned: u64,
    /// Expired records physically removed from the store
    pub records_purged: u64,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(manual: bool, resume_at: Option<DateTime<Utc>>) -> EmergencyStopRecord {
        EmergencyStopRecord {
            user_id: "u1".to_string(),
            active: true,
            reason: StopReason::new(StopType::Manual, Severity::High, "test"),
            triggered_at: Utc::now(),
            triggered_by: "ops".to_string(),
            manual_resume_required: manual,
            estimated_resume_time: resume_at,
        }
    }

    #[test]
    fn test_auto_resumable() {
        let now = Utc::now();
        assert!(record(false, Some(now - Duration::minutes(1))).is_auto_resumable(now));
        assert!(!record(false, Some(now + Duration::minutes(1))).is_auto_resumable(now));
        assert!(!record(true, Some(now - Duration::minutes(1))).is_auto_resumable(now));
        assert!(!record(false, None).is_auto_resumable(now));
    }

    #[test]
    fn test_reason_serializes_type_field() {
        let reason = StopReason::new(StopType::ComplianceViolation, Severity::Critical, "x");
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["type"], "COMPLIANCE_VIOLATION");
        assert_eq!(json["severity"], "CRITICAL");
        assert!(json["autoResumeAfterMinutes"].is_null());
    }
}
