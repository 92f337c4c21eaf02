//! Compliance handlers
//!
//! Per-user compliance scoring and the violation log.

use actix_web::{HttpResponse, web};
use serde::Deserialize;

use super::response::{ApiResponse, clamp_limit, parse_user};
use crate::AppState;
use crate::error::AppError;
use crate::models::{Severity, ViolationDetails, ViolationType};

/// Query parameters for listing violations
#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    pub limit: Option<usize>,
}

/// Request body for recording a violation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordViolationRequest {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// GET /v1/users/{userId}/compliance
///
/// Composite score, level, risk factors and the next allowed action time.
pub async fn get_compliance(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;

    let status = state
        .engine
        .compliance()
        .get_compliance_status(user_id)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(status)))
}

/// GET /v1/users/{userId}/violations
pub async fn list_violations(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ViolationsQuery>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let limit = clamp_limit(query.limit, 20, 100);

    let violations = state
        .engine
        .compliance()
        .recent_violations(user_id, limit)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(violations)))
}

/// POST /v1/users/{userId}/violations
///
/// A CRITICAL violation also stops the user until a human resumes.
pub async fn record_violation(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<RecordViolationRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let request = body.into_inner();

    let details = ViolationDetails {
        severity: request.severity,
        metadata: request.metadata,
    };
    let outcome = state
        .engine
        .record_violation(user_id, request.violation_type, details)
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::new(outcome)))
}

/// Configure compliance routes
pub fn configure_compliance_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/users/{userId}/compliance", web::get().to(get_compliance))
        .service(
            web::resource("/users/{userId}/violations")
                .route(web::get().to(list_violations))
                .route(web::post().to(record_violation)),
        );
}
