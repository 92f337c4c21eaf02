//! Emergency stop handlers
//!
//! Per-user stop, resume and history, plus the fleet-wide stop.

use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};

use super::response::{ApiResponse, clamp_limit, parse_user};
use crate::AppState;
use crate::error::AppError;
use crate::models::{EmergencyStopRecord, ResumeAuditEntry, StopIndexEntry, StopReason};

/// Request body for triggering a stop
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStopRequest {
    pub reason: StopReason,
    pub triggered_by: String,
}

/// Request body for resuming automation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub requested_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request body for the fleet-wide stop
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemWideStopRequest {
    pub reason: StopReason,
    pub triggered_by: String,
    pub affected_users: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Current stop for a user; `stop` is null when automation may run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStatusResponse {
    pub active: bool,
    pub stop: Option<EmergencyStopRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopHistoryResponse {
    pub stops: Vec<StopIndexEntry>,
    pub resumes: Vec<ResumeAuditEntry>,
}

/// GET /v1/users/{userId}/emergency-stop
///
/// Never fails on store trouble: an unreadable store reads as no stop.
pub async fn get_stop_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;

    let stop = state
        .engine
        .emergency()
        .get_emergency_stop_status(user_id)
        .await;

    Ok(HttpResponse::Ok().json(ApiResponse::new(StopStatusResponse {
        active: stop.is_some(),
        stop,
    })))
}

/// POST /v1/users/{userId}/emergency-stop:trigger
///
/// Re-triggering an active stop merges into it.
pub async fn trigger_stop(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TriggerStopRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let request = body.into_inner();

    let record = state
        .engine
        .emergency()
        .trigger_emergency_stop(user_id, request.reason, &request.triggered_by)
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::new(record)))
}

/// POST /v1/users/{userId}/emergency-stop:resume
///
/// 409 when there is no stop or an automated actor tries to lift a manual
/// stop, 422 when recent failures are still too high.
pub async fn resume_automation(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ResumeRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let request = body.into_inner();

    let outcome = state
        .engine
        .emergency()
        .resume_automation(user_id, &request.requested_by, request.notes.as_deref())
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(outcome)))
}

/// GET /v1/users/{userId}/emergency-stop/history
pub async fn get_stop_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let emergency = state.engine.emergency();
    let limit = clamp_limit(query.limit, 20, emergency.config().user_log_max);

    let stops = emergency.user_history(user_id, limit).await?;
    let resumes = emergency.resume_history(user_id, limit).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(StopHistoryResponse { stops, resumes })))
}

/// POST /v1/emergency-stop:system-wide
///
/// Per-user failures are reported in the body, not as an error status.
pub async fn system_wide_stop(
    state: web::Data<AppState>,
    body: web::Json<SystemWideStopRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    if request.affected_users.is_empty() {
        return Err(AppError::Validation("affectedUsers must not be empty".to_string()));
    }

    let result = state
        .engine
        .emergency()
        .trigger_system_wide_emergency_stop(request.reason, &request.triggered_by, &request.affected_users)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(result)))
}

/// Configure emergency stop routes
pub fn configure_emergency_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/emergency-stop:system-wide", web::post().to(system_wide_stop))
        .route("/users/{userId}/emergency-stop", web::get().to(get_stop_status))
        .route(
            "/users/{userId}/emergency-stop:trigger",
            web::post().to(trigger_stop),
        )
        .route(
            "/users/{userId}/emergency-stop:resume",
            web::post().to(resume_automation),
        )
        .route(
            "/users/{userId}/emergency-stop/history",
            web::get().to(get_stop_history),
        );
}
