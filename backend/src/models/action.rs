//! Action model and related types
//!
//! Outbound account actions the automation pipeline performs, the breaker
//! classes they are grouped into, and the outcomes reported back after each call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound action performed on behalf of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Connection request
    Invitation,
    /// Direct message
    Message,
    /// Profile visit
    ProfileView,
    /// Post reaction
    Like,
    /// Post comment
    Comment,
    /// Follow a member or company
    Follow,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        Self::Invitation,
        Self::Message,
        Self::ProfileView,
        Self::Like,
        Self::Comment,
        Self::Follow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::Message => "message",
            Self::ProfileView => "profile_view",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invitation" | "connection_request" => Some(Self::Invitation),
            "message" => Some(Self::Message),
            "profile_view" => Some(Self::ProfileView),
            "like" => Some(Self::Like),
            "comment" => Some(Self::Comment),
            "follow" => Some(Self::Follow),
            _ => None,
        }
    }

    /// Breaker class this action is gated by
    pub fn action_class(&self) -> ActionClass {
        match self {
            Self::Invitation | Self::Follow => ActionClass::Connection,
            Self::Message => ActionClass::Messaging,
            Self::Like | Self::Comment => ActionClass::Engagement,
            Self::ProfileView => ActionClass::Browsing,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Group of actions sharing one circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Connection,
    Messaging,
    Engagement,
    Browsing,
}

impl ActionClass {
    pub const ALL: [ActionClass; 4] = [
        Self::Connection,
        Self::Messaging,
        Self::Engagement,
        Self::Browsing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Messaging => "messaging",
            Self::Engagement => "engagement",
            Self::Browsing => "browsing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connection" => Some(Self::Connection),
            "messaging" => Some(Self::Messaging),
            "engagement" => Some(Self::Engagement),
            "browsing" => Some(Self::Browsing),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a failed upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error or 5xx from the platform
    Transient,
    /// Upstream call timed out
    Timeout,
    /// Platform answered with its own throttling response
    RateLimited,
    /// Session cookie or token no longer valid
    AuthenticationExpired,
    /// Captcha or identity verification challenge
    Challenge,
    /// Platform restricted the account
    AccountRestricted,
    /// Platform suspended the account
    AccountSuspended,
}

impl FailureKind {
    /// Explicit signals from the platform that the account is in trouble.
    /// These skip breaker threshold counting and stop automation outright.
    pub fn is_suspension_signal(&self) -> bool {
        matches!(self, Self::AccountRestricted | Self::AccountSuspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthenticationExpired => "authentication_expired",
            Self::Challenge => "challenge",
            Self::AccountRestricted => "account_restricted",
            Self::AccountSuspended => "account_suspended",
        }
    }
}

/// Outcome of an outbound call as reported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure(FailureKind),
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Entry in a user's bounded recent-activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub action: ActionType,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Entry in the fleet-wide outcome log used for limit recalibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEntry {
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Validate a user identifier before it is used in any store key.
///
/// Ids must be 1-128 characters with no whitespace or control characters.
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    if user_id.is_empty() {
        return Err("user id must not be empty".to_string());
    }
    if user_id.chars().count() > 128 {
        return Err("user id must be at most 128 characters".to_string());
    }
    if user_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("user id must not contain whitespace or control characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trips_through_str() {
        for action in ActionType::ALL {
            assert_eq!(ActionType::parse(action.as_str()), Some(action));
        }
        assert_eq!(ActionType::parse("connection_request"), Some(ActionType::Invitation));
        assert_eq!(ActionType::parse("poke"), None);
    }

    #[test]
    fn test_action_classes() {
        assert_eq!(ActionType::Invitation.action_class(), ActionClass::Connection);
        assert_eq!(ActionType::Follow.action_class(), ActionClass::Connection);
        assert_eq!(ActionType::Comment.action_class(), ActionClass::Engagement);
        assert_eq!(ActionType::ProfileView.action_class(), ActionClass::Browsing);
    }

    #[test]
    fn test_suspension_signals() {
        assert!(FailureKind::AccountSuspended.is_suspension_signal());
        assert!(FailureKind::AccountRestricted.is_suspension_signal());
        assert!(!FailureKind::Transient.is_suspension_signal());
        assert!(!FailureKind::Challenge.is_suspension_signal());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ActionOutcome::Failure(FailureKind::Timeout)).unwrap();
        assert_eq!(json, serde_json::json!({"result": "failure", "kind": "timeout"}));
        let parsed: ActionOutcome = serde_json::from_str(r#"{"result":"success"}"#).unwrap();
        assert_eq!(parsed, ActionOutcome::Success);
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("user-42").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("has space").is_err());
        assert!(validate_user_id(&"x".repeat(129)).is_err());
    }
}
