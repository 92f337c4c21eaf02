pub mod activity_log;
pub mod circuit_breaker;
pub mod clock;
pub mod compliance;
pub mod emergency_stop;
pub mod engine;
pub mod jobs;
pub mod notifier;
pub mod outbox;
pub mod pattern_analyzer;
pub mod pg_store;
pub mod rate_limiter;
pub mod store;

pub use activity_log::{ActivityLog, failure_rate};
pub use circuit_breaker::{BreakerCensus, CircuitBreakerConfig, CircuitBreakerService, OutcomeResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compliance::{ComplianceConfig, ComplianceService, next_allowed_action};
pub use emergency_stop::{EmergencyStopConfig, EmergencyStopService, is_automated_actor};
pub use engine::{
    BlockedBy, EngineConfig, OutcomeReport, PreflightDecision, SafetyEngine, ViolationOutcome,
};
pub use jobs::{
    JobConfig, LimitAdjustmentJob, MaintenanceJob, OutboxRelayJob, run_limit_adjustment,
    run_maintenance, run_outbox_relay,
};
pub use notifier::{
    BroadcastNotifier, NotificationAction, NotificationChannel, Notifier, NotifyError,
    RecordingNotifier, SafetyNotification,
};
pub use outbox::{
    OutboxConfig, OutboxError, OutboxEvent, OutboxNotifier, OutboxService, OutboxStats,
    OutboxStatus, RelayReport,
};
pub use pattern_analyzer::{PatternAnalysis, PatternAnalyzer, PatternConfig};
pub use pg_store::PostgresStore;
pub use rate_limiter::{
    ActionLimit, AdjustmentDirection, EffectiveLimits, LimitAdjustment, RateLimitConfig,
    RateLimitResult, RateLimiterService, UserUsage, WindowScope, WindowUsage,
    default_action_limits,
};
pub use store::{
    InMemoryStore, RecordKind, SafetyStore, StoreError, StoreKey, TimeoutStore, UnavailableStore,
};
