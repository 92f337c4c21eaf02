//! Compliance violation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity shared by violations and emergency stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Points deducted from the compliance-history sub-score
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 5.0,
            Self::Medium => 10.0,
            Self::High => 20.0,
            Self::Critical => 40.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    /// A local cap was hit or the platform throttled a call
    RateLimitExceeded,
    /// Robotic or bursty request timing
    SuspiciousPattern,
    /// Volume jumped well above the user's baseline
    RapidIncrease,
    /// Platform showed a warning banner or challenge
    PlatformWarning,
    /// Platform restricted or suspended the account
    AccountRestriction,
    /// Composite compliance score fell into VIOLATION
    LowComplianceScore,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SuspiciousPattern => "SUSPICIOUS_PATTERN",
            Self::RapidIncrease => "RAPID_INCREASE",
            Self::PlatformWarning => "PLATFORM_WARNING",
            Self::AccountRestriction => "ACCOUNT_RESTRICTION",
            Self::LowComplianceScore => "LOW_COMPLIANCE_SCORE",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            Self::RateLimitExceeded | Self::RapidIncrease => Severity::Medium,
            Self::SuspiciousPattern | Self::LowComplianceScore => Severity::Medium,
            Self::PlatformWarning => Severity::High,
            Self::AccountRestriction => Severity::Critical,
        }
    }
}

/// Append-only violation log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub user_id: String,
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Caller-supplied details for a new violation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationDetails {
    /// Overrides the type's default severity
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
