//! Safety Engine
//!
//! Wires the rate limiter, circuit breakers, compliance scorer and emergency
//! stop over one store, clock and notifier, and exposes the automation
//! pipeline contract as two calls: `preflight` before an outbound action and
//! `record_outcome` after it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerService};
use super::clock::Clock;
use super::compliance::{ComplianceConfig, ComplianceService};
use super::emergency_stop::{EmergencyStopConfig, EmergencyStopService, resume_eta};
use super::notifier::Notifier;
use super::pattern_analyzer::{PatternAnalyzer, PatternConfig};
use super::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiterService};
use super::store::{SafetyStore, StoreError};
use crate::error::SafetyError;
use crate::models::{
    ActionOutcome, ActionType, BreakerDecision, BreakerTransition, CircuitBreakerRecord, EmergencyStopRecord,
    FailureKind, Severity, StopReason, StopType, ViolationDetails, ViolationRecord, ViolationType,
    validate_user_id,
};

/// Actor recorded on stops the engine triggers itself
pub const ENGINE_ACTOR: &str = "circuit-breaker";

/// Auto-resume delay for a stop caused by a failed HALF_OPEN trial
pub const REOPENED_STOP_MINUTES: u32 = 60;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub pattern: PatternConfig,
    pub compliance: ComplianceConfig,
    pub breaker: CircuitBreakerConfig,
    pub emergency: EmergencyStopConfig,
    /// Seed for the limit-relaxation roll; `None` seeds from entropy
    pub rng_seed: Option<u64>,
}

/// Which gate refused an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedBy {
    EmergencyStop,
    RateLimit,
    CircuitBreaker,
}

/// Combined answer of every gate for one prospective action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightDecision {
    pub allowed: bool,
    pub blocked_by: Option<BlockedBy>,
    pub reason: Option<String>,
    /// Seconds until the refusing gate may allow the action
    pub retry_after: Option<u64>,
    pub emergency_stop: Option<EmergencyStopRecord>,
    pub rate_limit: Option<RateLimitResult>,
    pub breaker: Option<BreakerDecision>,
}

impl PreflightDecision {
    fn blocked(blocked_by: BlockedBy, reason: Option<String>, retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            blocked_by: Some(blocked_by),
            reason,
            retry_after,
            emergency_stop: None,
            rate_limit: None,
            breaker: None,
        }
    }
}

/// What recording an outcome changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReport {
    pub breaker: CircuitBreakerRecord,
    pub transition: BreakerTransition,
    pub emergency_stop: Option<EmergencyStopRecord>,
    pub violation: Option<ViolationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationOutcome {
    pub violation: ViolationRecord,
    pub emergency_stop: Option<EmergencyStopRecord>,
}

pub struct SafetyEngine {
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<RateLimiterService>,
    breakers: Arc<CircuitBreakerService>,
    compliance: Arc<ComplianceService>,
    emergency: Arc<EmergencyStopService>,
}

impl SafetyEngine {
    pub fn new(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let rate_limiter = Arc::new(match config.rng_seed {
            Some(seed) => RateLimiterService::with_seed(store.clone(), clock.clone(), config.rate_limit, seed),
            None => RateLimiterService::new(store.clone(), clock.clone(), config.rate_limit),
        });
        let breakers = Arc::new(CircuitBreakerService::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.breaker,
        ));
        let compliance = Arc::new(ComplianceService::new(
            store.clone(),
            clock.clone(),
            rate_limiter.clone(),
            PatternAnalyzer::new(config.pattern),
            config.compliance,
        ));
        let emergency = Arc::new(EmergencyStopService::new(
            store.clone(),
            clock.clone(),
            notifier,
            breakers.clone(),
            config.emergency,
        ));

        Self {
            store,
            clock,
            rate_limiter,
            breakers,
            compliance,
            emergency,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiterService> {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerService> {
        &self.breakers
    }

    pub fn compliance(&self) -> &Arc<ComplianceService> {
        &self.compliance
    }

    pub fn emergency(&self) -> &Arc<EmergencyStopService> {
        &self.emergency
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Round-trip to the backing store
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Decide whether `action` may run now.
    ///
    /// Gates run cheapest-first: emergency stop, rate limit, then the
    /// breaker. The breaker goes last because admitting a HALF_OPEN trial
    /// consumes it.
    pub async fn preflight(&self, user_id: &str, action: ActionType) -> Result<PreflightDecision, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        if let Some(stop) = self.emergency.get_emergency_stop_status(user_id).await {
            let retry_after = resume_eta(&stop, self.clock.now()).map(|eta| eta.num_seconds() as u64);
            let reason = format!("emergency stop active: {}", stop.reason.description);
            return Ok(PreflightDecision {
                emergency_stop: Some(stop),
                ..PreflightDecision::blocked(BlockedBy::EmergencyStop, Some(reason), retry_after)
            });
        }

        let rate_limit = self.rate_limiter.check_rate_limit(user_id, action).await;
        if !rate_limit.allowed {
            return Ok(
                PreflightDecision::blocked(BlockedBy::RateLimit, rate_limit.reason.clone(), rate_limit.retry_after)
                    .with_rate_limit(rate_limit),
            );
        }

        let breaker = self
            .breakers
            .is_operation_allowed(user_id, action.action_class())
            .await;
        if !breaker.allowed {
            return Ok(
                PreflightDecision::blocked(BlockedBy::CircuitBreaker, breaker.reason.clone(), breaker.retry_after)
                    .with_rate_limit(rate_limit)
                    .with_breaker(breaker),
            );
        }

        Ok(PreflightDecision {
            allowed: true,
            blocked_by: None,
            reason: None,
            retry_after: None,
            emergency_stop: None,
            rate_limit: Some(rate_limit),
            breaker: Some(breaker),
        })
    }

    /// Record the outcome of an action and escalate where required.
    ///
    /// A suspension signal stops the user until a human resumes. A failed
    /// HALF_OPEN trial stops the user for an hour. Platform throttling is
    /// logged as a violation.
    pub async fn record_outcome(
        &self,
        user_id: &str,
        action: ActionType,
        outcome: ActionOutcome,
    ) -> Result<OutcomeReport, SafetyError> {
        self.rate_limiter
            .record_request(user_id, action, outcome.is_success())
            .await?;

        let action_class = action.action_class();
        let kind = match outcome {
            ActionOutcome::Success => {
                let result = self.breakers.record_success(user_id, action_class).await?;
                return Ok(OutcomeReport {
                    breaker: result.record,
                    transition: result.transition,
                    emergency_stop: None,
                    violation: None,
                });
            }
            ActionOutcome::Failure(kind) => kind,
        };

        let result = self.breakers.record_failure(user_id, action_class, kind).await?;

        let emergency_stop = match result.transition {
            BreakerTransition::EscalationRequired => {
                let reason = StopReason::new(
                    StopType::AccountSuspension,
                    Severity::Critical,
                    format!("platform reported {}", kind.as_str()),
                )
                .with_metadata(serde_json::json!({
                    "action": action,
                    "actionClass": action_class,
                }));
                Some(self.escalate(user_id, reason).await?)
            }
            BreakerTransition::Reopened => {
                let reason = StopReason::new(
                    StopType::CircuitBreaker,
                    Severity::High,
                    format!("{action_class} breaker reopened after a failed trial"),
                )
                .auto_resume_after(REOPENED_STOP_MINUTES)
                .with_metadata(serde_json::json!({
                    "actionClass": action_class,
                    "failureCount": result.record.failure_count,
                }));
                Some(self.escalate(user_id, reason).await?)
            }
            _ => None,
        };

        let violation = if kind == FailureKind::RateLimited {
            let details = ViolationDetails {
                severity: None,
                metadata: serde_json::json!({
                    "source": "platform",
                    "action": action,
                }),
            };
            Some(
                self.compliance
                    .record_violation(user_id, ViolationType::RateLimitExceeded, details)
                    .await?,
            )
        } else {
            None
        };

        Ok(OutcomeReport {
            breaker: result.record,
            transition: result.transition,
            emergency_stop,
            violation,
        })
    }

    /// Record a violation; a CRITICAL one also stops the user until a human resumes
    pub async fn record_violation(
        &self,
        user_id: &str,
        violation_type: ViolationType,
        details: ViolationDetails,
    ) -> Result<ViolationOutcome, SafetyError> {
        let violation = self
            .compliance
            .record_violation(user_id, violation_type, details)
            .await?;

        let emergency_stop = if violation.severity == Severity::Critical {
            let reason = StopReason::new(
                StopType::ComplianceViolation,
                Severity::Critical,
                format!("critical violation: {}", violation_type.as_str()),
            )
            .with_metadata(violation.metadata.clone());
            Some(self.escalate(user_id, reason).await?)
        } else {
            None
        };

        Ok(ViolationOutcome {
            violation,
            emergency_stop,
        })
    }

    async fn escalate(&self, user_id: &str, reason: StopReason) -> Result<EmergencyStopRecord, SafetyError> {
        warn!(
            user_id = %user_id,
            reason_type = %reason.reason_type,
            severity = %reason.severity,
            "Escalating to emergency stop"
        );
        let record = self
            .emergency
            .trigger_emergency_stop(user_id, reason, ENGINE_ACTOR)
            .await?;
        info!(user_id = %user_id, manual = record.manual_resume_required, "Escalation recorded");
        Ok(record)
    }
}

impl PreflightDecision {
    fn with_rate_limit(mut self, rate_limit: RateLimitResult) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    fn with_breaker(mut self, breaker: BreakerDecision) -> Self {
        self.breaker = Some(breaker);
        self
    }
}
