//! Health handler
//!
//! Liveness plus a store round-trip, timed.

use std::time::Instant;

use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: StoreHealth,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub backend: &'static str,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /health
///
/// 200 when the store answers a ping, 503 otherwise.
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let ping = state.engine.ping().await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let backend = if state.config.database_url.is_some() {
        "postgres"
    } else {
        "memory"
    };
    let (status, error) = match ping {
        Ok(()) => (HealthStatus::Healthy, None),
        Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
    };

    let report = HealthReport {
        status,
        store: StoreHealth {
            backend,
            latency_ms,
            error,
        },
        checked_at: state.engine.clock().now(),
    };

    match status {
        HealthStatus::Healthy => HttpResponse::Ok().json(report),
        HealthStatus::Unhealthy => HttpResponse::ServiceUnavailable().json(report),
    }
}

/// Configure health routes
pub fn configure_health_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health));
}
