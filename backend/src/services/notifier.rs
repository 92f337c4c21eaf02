//! Outbound notifications
//!
//! Components publish breaker and emergency-stop events through an injected
//! `Notifier`. Publishing happens after the state change is persisted; a
//! failed publish is logged by the caller and never rolls the change back.
//! Durable at-least-once delivery is provided by `OutboxNotifier`.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::outbox::OutboxError;
use crate::models::{ActionClass, CircuitBreakerRecord, EmergencyStopRecord, StopReason, SystemWideStopResult};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationChannel {
    #[serde(rename = "safety.circuit_breaker")]
    CircuitBreaker,
    #[serde(rename = "safety.emergency_stop")]
    EmergencyStop,
    #[serde(rename = "safety.fleet")]
    Fleet,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitBreaker => "safety.circuit_breaker",
            Self::EmergencyStop => "safety.emergency_stop",
            Self::Fleet => "safety.fleet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safety.circuit_breaker" => Some(Self::CircuitBreaker),
            "safety.emergency_stop" => Some(Self::EmergencyStop),
            "safety.fleet" => Some(Self::Fleet),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Opened,
    Closed,
    Triggered,
    Resumed,
}

/// Event published to a notification channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyNotification {
    pub id: Uuid,
    pub channel: NotificationChannel,
    pub action: NotificationAction,
    /// `None` on the fleet channel
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_class: Option<ActionClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl SafetyNotification {
    fn new(channel: NotificationChannel, action: NotificationAction, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            action,
            user_id: None,
            action_class: None,
            reason: None,
            details: serde_json::Value::Null,
            occurred_at,
        }
    }

    pub fn breaker_opened(record: &CircuitBreakerRecord) -> Self {
        Self {
            user_id: Some(record.user_id.clone()),
            action_class: Some(record.action_class),
            details: serde_json::json!({
                "failureCount": record.failure_count,
                "nextAttemptTime": record.next_attempt_time,
            }),
            ..Self::new(NotificationChannel::CircuitBreaker, NotificationAction::Opened, record.updated_at)
        }
    }

    pub fn breaker_closed(user_id: &str, action_class: ActionClass, at: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            action_class: Some(action_class),
            ..Self::new(NotificationChannel::CircuitBreaker, NotificationAction::Closed, at)
        }
    }

    pub fn stop_triggered(record: &EmergencyStopRecord) -> Self {
        Self {
            user_id: Some(record.user_id.clone()),
            reason: Some(record.reason.clone()),
            details: serde_json::json!({
                "triggeredBy": record.triggered_by,
                "manualResumeRequired": record.manual_resume_required,
                "estimatedResumeTime": record.estimated_resume_time,
            }),
            ..Self::new(NotificationChannel::EmergencyStop, NotificationAction::Triggered, record.triggered_at)
        }
    }

    pub fn stop_resumed(user_id: &str, resumed_by: &str, automatic: bool, at: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            details: serde_json::json!({
                "resumedBy": resumed_by,
                "automatic": automatic,
            }),
            ..Self::new(NotificationChannel::EmergencyStop, NotificationAction::Resumed, at)
        }
    }

    pub fn fleet_stop(reason: &StopReason, triggered_by: &str, result: &SystemWideStopResult) -> Self {
        Self {
            reason: Some(reason.clone()),
            details: serde_json::json!({
                "triggeredBy": triggered_by,
                "affectedUsers": result.affected_users,
                "succeeded": result.succeeded,
                "failed": result.failed.len(),
            }),
            ..Self::new(NotificationChannel::Fleet, NotificationAction::Triggered, result.triggered_at)
        }
    }
}

/// Publish-only notification capability
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: SafetyNotification) -> Result<(), NotifyError>;
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SafetyNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyNotification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, notification: SafetyNotification) -> Result<(), NotifyError> {
        // No subscribers is not an error
        if self.sender.send(notification).is_err() {
            debug!("Notification dropped: no subscribers");
        }
        Ok(())
    }
}

/// Keeps every published notification (for testing)
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<SafetyNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that rejects every publish
    pub fn failing() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn published(&self) -> Vec<SafetyNotification> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, channel: NotificationChannel, action: NotificationAction) -> usize {
        self.published()
            .iter()
            .filter(|n| n.channel == channel && n.action == action)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: SafetyNotification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Delivery("notifier unavailable".to_string()));
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}
