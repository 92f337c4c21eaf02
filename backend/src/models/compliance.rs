//! Compliance status and report types
//!
//! Derived values only; nothing here is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceLevel {
    Compliant,
    Warning,
    Violation,
}

impl ComplianceLevel {
    /// >= 80 compliant, 50-79 warning, < 50 violation
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Compliant
        } else if score >= 50.0 {
            Self::Warning
        } else {
            Self::Violation
        }
    }
}

/// The four independently clamped inputs to the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubScores {
    pub window_headroom: f64,
    pub timing_regularity: f64,
    pub velocity: f64,
    pub compliance_history: f64,
}

impl Default for SubScores {
    fn default() -> Self {
        Self {
            window_headroom: 100.0,
            timing_regularity: 100.0,
            velocity: 100.0,
            compliance_history: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStatus {
    pub user_id: String,
    pub score: f64,
    pub status: ComplianceLevel,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
    pub next_allowed_action: DateTime<Utc>,
    pub sub_scores: SubScores,
    /// False when part of the history could not be read and defaults were used
    pub data_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBreakdown {
    pub compliant: usize,
    pub warning: usize,
    pub violation: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactorCount {
    pub factor: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub total_users: usize,
    pub status_breakdown: StatusBreakdown,
    pub average_score: f64,
    pub top_risk_factors: Vec<RiskFactorCount>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(ComplianceLevel::from_score(100.0), ComplianceLevel::Compliant);
        assert_eq!(ComplianceLevel::from_score(80.0), ComplianceLevel::Compliant);
        assert_eq!(ComplianceLevel::from_score(79.9), ComplianceLevel::Warning);
        assert_eq!(ComplianceLevel::from_score(50.0), ComplianceLevel::Warning);
        assert_eq!(ComplianceLevel::from_score(49.9), ComplianceLevel::Violation);
        assert_eq!(ComplianceLevel::from_score(0.0), ComplianceLevel::Violation);
    }
}
