//! Circuit breaker handlers

use actix_web::{HttpResponse, web};

use super::response::{ApiResponse, parse_class, parse_user};
use crate::AppState;
use crate::error::AppError;

/// GET /v1/users/{userId}/breakers
pub async fn list_breakers(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let user_id = parse_user(&user_id)?;

    let breakers = state.engine.breakers().list_user_breakers(user_id).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(breakers)))
}

/// GET /v1/users/{userId}/breakers/{class}
///
/// 404 when no breaker exists yet for the class.
pub async fn get_breaker(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (user_id, action_class) = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let action_class = parse_class(&action_class)?;

    let breaker = state
        .engine
        .breakers()
        .get_breaker(user_id, action_class)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No {action_class} breaker for user {user_id}")))?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(breaker)))
}

/// POST /v1/users/{userId}/breakers/{class}:reset
///
/// Force the breaker back to CLOSED.
pub async fn reset_breaker(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (user_id, action_class) = path.into_inner();
    let user_id = parse_user(&user_id)?;
    let action_class = parse_class(&action_class)?;

    let breaker = state
        .engine
        .breakers()
        .reset_breaker(user_id, action_class)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::new(breaker)))
}

/// Configure breaker routes
pub fn configure_breaker_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/users/{userId}/breakers", web::get().to(list_breakers))
        .route(
            "/users/{userId}/breakers/{class:[a-z_]+}:reset",
            web::post().to(reset_breaker),
        )
        .route(
            "/users/{userId}/breakers/{class:[a-z_]+}",
            web::get().to(get_breaker),
        );
}
