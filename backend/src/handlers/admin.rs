//! Admin HTTP Handlers
//!
//! Fleet-level read views: the compliance report, the emergency stop
//! dashboard and the rate limits currently in force.

use actix_web::{HttpResponse, web};

use super::response::ApiResponse;
use crate::AppState;
use crate::error::AppError;

/// GET /v1/admin/compliance/report
pub async fn compliance_report(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let report = state.engine.compliance().get_compliance_report().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::new(report)))
}

/// GET /v1/admin/emergency-stops/dashboard
///
/// Active stops by type and severity, recent stops and breaker state counts.
pub async fn emergency_dashboard(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let dashboard = state
        .engine
        .emergency()
        .get_emergency_stop_dashboard()
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::new(dashboard)))
}

/// GET /v1/admin/limits
///
/// Per-action and global caps after the adaptive multiplier.
pub async fn effective_limits(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let limits = state.engine.rate_limiter().effective_limits().await;
    Ok(HttpResponse::Ok().json(ApiResponse::new(limits)))
}

/// Configure admin routes
pub fn configure_admin_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/compliance/report", web::get().to(compliance_report))
            .route("/emergency-stops/dashboard", web::get().to(emergency_dashboard))
            .route("/limits", web::get().to(effective_limits)),
    );
}
