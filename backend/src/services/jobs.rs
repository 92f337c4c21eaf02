//! Background Jobs
//!
//! Interval loops for the periodic safety work: the maintenance sweep, limit
//! recalibration and (with Postgres) the notification outbox relay. Each job
//! runs once at startup, then on its interval until shut down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::SafetyError;
use crate::models::MaintenanceReport;
use crate::services::engine::SafetyEngine;
use crate::services::notifier::Notifier;
use crate::services::outbox::{OutboxError, OutboxService, RelayReport};
use crate::services::rate_limiter::LimitAdjustment;

/// Schedule for a background job
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Interval between runs
    pub interval: Duration,
    /// Whether the job is enabled
    pub enabled: bool,
}

impl JobConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            interval: Duration::from_secs(60),
            enabled: false,
        }
    }
}

/// Relay passes between cleanups of delivered rows
const OUTBOX_CLEANUP_EVERY: u64 = 360;

/// Delivered outbox rows are kept this long
const OUTBOX_RETENTION_DAYS: i64 = 7;

/// Spawn `run` immediately and then on every tick until shutdown
fn spawn_periodic<F, Fut>(name: &'static str, config: &JobConfig, mut run: F) -> watch::Sender<bool>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    if !config.enabled {
        info!(job = name, "Background job is disabled");
        return shutdown_tx;
    }

    let interval = config.interval;

    tokio::spawn(async move {
        info!(job = name, ?interval, "Starting background job");

        // Run immediately on startup
        run().await;

        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                _ = interval_timer.tick() => run().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(job = name, "Background job shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

/// Auto-resumes expired stops, removes stale breakers and prunes the stop index
pub struct MaintenanceJob {
    engine: Arc<SafetyEngine>,
    config: JobConfig,
}

impl MaintenanceJob {
    pub fn new(engine: Arc<SafetyEngine>, config: JobConfig) -> Self {
        Self { engine, config }
    }

    /// Start the job. Returns a shutdown sender.
    pub fn start(self) -> watch::Sender<bool> {
        let engine = self.engine;
        spawn_periodic("maintenance", &self.config, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = run_maintenance(&engine).await {
                    error!(error = %e, "Safety maintenance failed");
                }
            }
        })
    }
}

/// Recalibrates the adaptive rate limit multiplier
pub struct LimitAdjustmentJob {
    engine: Arc<SafetyEngine>,
    config: JobConfig,
}

impl LimitAdjustmentJob {
    pub fn new(engine: Arc<SafetyEngine>, config: JobConfig) -> Self {
        Self { engine, config }
    }

    pub fn start(self) -> watch::Sender<bool> {
        let engine = self.engine;
        spawn_periodic("limit_adjustment", &self.config, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = run_limit_adjustment(&engine).await {
                    error!(error = %e, "Limit adjustment failed");
                }
            }
        })
    }
}

/// Delivers queued notifications from the Postgres outbox
pub struct OutboxRelayJob {
    outbox: Arc<OutboxService>,
    notifier: Arc<dyn Notifier>,
    config: JobConfig,
}

impl OutboxRelayJob {
    pub fn new(outbox: Arc<OutboxService>, notifier: Arc<dyn Notifier>, config: JobConfig) -> Self {
        Self {
            outbox,
            notifier,
            config,
        }
    }

    pub fn start(self) -> watch::Sender<bool> {
        let outbox = self.outbox;
        let notifier = self.notifier;
        let worker_id = format!("relay-{}", uuid::Uuid::new_v4());
        let mut passes: u64 = 0;
        spawn_periodic("outbox_relay", &self.config, move || {
            let outbox = outbox.clone();
            let notifier = notifier.clone();
            let worker_id = worker_id.clone();
            let cleanup = passes % OUTBOX_CLEANUP_EVERY == 0;
            passes += 1;
            async move {
                if let Err(e) = run_outbox_relay(&outbox, notifier.as_ref(), &worker_id).await {
                    error!(error = %e, "Outbox relay failed");
                }
                if cleanup {
                    match outbox.cleanup_processed(OUTBOX_RETENTION_DAYS).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "Cleaned up delivered outbox rows"),
                        Err(e) => error!(error = %e, "Outbox cleanup failed"),
                    }
                }
            }
        })
    }
}

/// Run a single maintenance sweep (for manual triggering or testing)
pub async fn run_maintenance(engine: &SafetyEngine) -> Result<MaintenanceReport, SafetyError> {
    let report = engine.emergency().perform_maintenance_tasks().await?;
    debug!(?report, "Maintenance sweep finished");
    Ok(report)
}

/// Run a single limit recalibration (for manual triggering or testing)
pub async fn run_limit_adjustment(engine: &SafetyEngine) -> Result<LimitAdjustment, SafetyError> {
    let adjustment = engine.rate_limiter().adjust_limits_based_on_errors().await?;
    debug!(?adjustment, "Limit adjustment finished");
    Ok(adjustment)
}

/// Run a single relay pass (for manual triggering or testing)
pub async fn run_outbox_relay(
    outbox: &OutboxService,
    notifier: &dyn Notifier,
    worker_id: &str,
) -> Result<RelayReport, OutboxError> {
    let report = outbox.relay(worker_id, notifier).await?;
    if report.claimed > 0 {
        debug!(?report, "Outbox relay pass finished");
    }
    Ok(report)
}
