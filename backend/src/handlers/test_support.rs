//! Shared fixtures for the HTTP tests

use std::sync::Arc;

use actix_web::web;
use chrono::{TimeZone, Utc};

use crate::AppState;
use crate::config::Config;
use crate::services::{
    EngineConfig, InMemoryStore, ManualClock, RecordingNotifier, SafetyEngine, SafetyStore,
};

pub(crate) struct TestApp {
    pub state: web::Data<AppState>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

/// App state over a fresh in-memory store and a clock pinned to a weekday morning
pub(crate) fn test_app() -> TestApp {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    test_app_with_store(store, clock)
}

pub(crate) fn test_app_with_store(store: Arc<dyn SafetyStore>, clock: Arc<ManualClock>) -> TestApp {
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = SafetyEngine::new(
        store,
        clock.clone(),
        notifier.clone(),
        EngineConfig {
            rng_seed: Some(11),
            ..EngineConfig::default()
        },
    );
    TestApp {
        state: web::Data::new(AppState {
            config: Config::default(),
            engine: Arc::new(engine),
        }),
        clock,
        notifier,
    }
}
