//! Action handlers
//!
//! The automation pipeline contract: ask before an outbound action, report
//! the outcome after it.

use actix_web::{HttpResponse, web};
use serde::Deserialize;

use super::response::{ApiResponse, parse_action, parse_user};
use crate::AppState;
use crate::error::AppError;
use crate::models::ActionOutcome;

/// Request body for recording an outcome
#[derive(Debug, Deserialize)]
pub struct RecordOutcomeRequest {
    pub outcome: ActionOutcome,
}

/// POST /v1/users/{userId}/actions/{action}:check
///
/// Rate-limit check only. Never fails on store trouble: the limiter fails open.
pub async fn check_action(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (user_id, action) = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let action = parse_action(&action)?;

    let result = state
        .engine
        .rate_limiter()
        .check_rate_limit(user_id, action)
        .await;

    Ok(HttpResponse::Ok().json(ApiResponse::new(result)))
}

/// GET /v1/users/{userId}/actions/{action}/preflight
///
/// Every gate in order: emergency stop, rate limit, circuit breaker.
pub async fn preflight_action(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (user_id, action) = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let action = parse_action(&action)?;

    let decision = state.engine.preflight(user_id, action).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(decision)))
}

/// POST /v1/users/{userId}/actions/{action}:record
///
/// Record what happened upstream and apply escalation.
pub async fn record_action(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<RecordOutcomeRequest>,
) -> Result<HttpResponse, AppError> {
    let (user_id, action) = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let action = parse_action(&action)?;

    let report = state
        .engine
        .record_outcome(user_id, action, body.into_inner().outcome)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(report)))
}

/// Configure action routes
pub fn configure_action_routes(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/users/{userId}/actions/{action:[a-z_]+}:check",
        web::post().to(check_action),
    )
    .route(
        "/users/{userId}/actions/{action:[a-z_]+}:record",
        web::post().to(record_action),
    )
    .route(
        "/users/{userId}/actions/{action:[a-z_]+}/preflight",
        web::get().to(preflight_action),
    );
}
