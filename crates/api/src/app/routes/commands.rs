use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use userserver_core::AggregateId;
use userserver_events::Command;

use crate::app::dto::{DispatchRequest, DispatchResponse};
use crate::app::errors::{dispatch_error_to_response, json_error};
use crate::app::services::AppServices;
use crate::context::PrincipalContext;

/// `POST /dispatch`: run one command through the command bus.
pub async fn dispatch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text());
        }
    };

    let aggregate_id = match req.aggregate_id {
        Some(raw) => match AggregateId::parse(raw) {
            Ok(id) => id,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
        },
        None => AggregateId::generate(),
    };

    let mut command = Command::new(req.command, aggregate_id, req.payload);
    if let Some(principal_id) = principal.principal_id() {
        command = command.issued_by(principal_id.clone());
    }

    match services.dispatch(command).await {
        Ok(done) => (StatusCode::OK, Json(DispatchResponse::from(done))).into_response(),
        Err(e) => dispatch_error_to_response(e),
    }
}
