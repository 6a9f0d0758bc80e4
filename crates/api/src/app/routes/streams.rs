use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use userserver_core::AggregateId;
use userserver_infra::DispatchError;
use userserver_infra::event_store::load_events;

use crate::app::dto::StreamResponse;
use crate::app::errors::{dispatch_error_to_response, json_error};
use crate::app::services::AppServices;

/// `GET /streams/:aggregate_id`: the full stream in version order.
pub async fn load(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_id): Path<String>,
) -> Response {
    let aggregate_id = match AggregateId::parse(aggregate_id) {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match load_events(&**services.commands.store(), &aggregate_id).await {
        Ok(events) => Json(StreamResponse {
            aggregate_id: aggregate_id.to_string(),
            version: events.last().map(|e| e.version).unwrap_or(0),
            events,
        })
        .into_response(),
        Err(e) => dispatch_error_to_response(DispatchError::from(e)),
    }
}
