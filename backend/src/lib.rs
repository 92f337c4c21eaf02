//! LinkGuard - safety and compliance engine for LinkedIn account automation
//!
//! Keeps automated outreach inside ultra-conservative limits: adaptive rate
//! limiting, behavioural compliance scoring, per-class circuit breakers and a
//! per-user or fleet-wide emergency stop, all over one swappable store.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

pub use config::{Config, ConfigError};
pub use error::{AppError, ConflictReason, SafetyError};

pub use services::{
    BroadcastNotifier, Clock, EngineConfig, InMemoryStore, Notifier, PostgresStore, SafetyEngine,
    SafetyStore, StoreError, SystemClock, TimeoutStore,
};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub engine: Arc<SafetyEngine>,
}
