use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use userserver_core::AggregateId;

use crate::app::dto::UserResponse;
use crate::app::errors::json_error;
use crate::app::services::AppServices;

/// `GET /users/:user_id` from the user directory projection.
pub async fn get(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
) -> Response {
    let Ok(user_id) = AggregateId::parse(user_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found", "user not found");
    };

    match services.users.read(|d| d.get(&user_id).map(UserResponse::from)) {
        Some(user) => Json(user).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "not_found", "user not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

/// `GET /users?email=...`
pub async fn find_by_email(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<EmailQuery>,
) -> Response {
    match services
        .users
        .read(|d| d.find_by_email(&query.email).map(UserResponse::from))
    {
        Some(user) => Json(user).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "not_found", "user not found"),
    }
}
