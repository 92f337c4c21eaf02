//! Response envelope and path helpers shared by the handlers

use serde::Serialize;

use crate::error::AppError;
use crate::models::{ActionClass, ActionType, validate_user_id};

/// Standard API response wrapper
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    data: T,
    meta: ResponseMeta,
}

#[derive(Serialize)]
struct ResponseMeta {
    request_id: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            data,
            meta: ResponseMeta {
                request_id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}

pub(crate) fn parse_user(user_id: &str) -> Result<&str, AppError> {
    validate_user_id(user_id).map_err(AppError::Validation)?;
    Ok(user_id)
}

pub(crate) fn parse_action(action: &str) -> Result<ActionType, AppError> {
    ActionType::parse(action).ok_or_else(|| AppError::Validation(format!("Unknown action type: {action}")))
}

pub(crate) fn parse_class(action_class: &str) -> Result<ActionClass, AppError> {
    ActionClass::parse(action_class)
        .ok_or_else(|| AppError::Validation(format!("Unknown action class: {action_class}")))
}

/// Default and ceiling for `?limit=` on list endpoints
pub(crate) fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max)
}
