use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use userserver_core::DomainError;
use userserver_infra::DispatchError;

/// Map a dispatch failure to its HTTP response.
///
/// 4xx means the request itself must change. Transient failures (a conflict
/// that outlasted the retry budget, a storage outage) are 503 with
/// `retryable: true`: the client may resubmit unchanged. Storage and internal error details stay in
/// the logs.
pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::ValidationFailed(domain) => domain_error_to_response(domain),
        DispatchError::HandlerNotFound(command_type) => json_error(
            StatusCode::NOT_FOUND,
            "unknown_command",
            format!("no handler for command '{command_type}'"),
        ),
        DispatchError::ConcurrencyConflict { aggregate_id, .. } => retryable_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "concurrency_conflict",
            format!("{aggregate_id} was modified concurrently"),
        ),
        DispatchError::StorageUnavailable(detail) => {
            tracing::error!(%detail, "event store unavailable");
            retryable_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "storage is temporarily unavailable",
            )
        }
        DispatchError::Internal(detail) => {
            tracing::error!(%detail, "dispatch failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invariant_violation", msg)
        }
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "retryable": false,
        })),
    )
        .into_response()
}

fn retryable_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "retryable": true,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use userserver_core::{AggregateId, ExpectedVersion};

    use super::*;

    async fn body(res: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejections_are_client_errors() {
        let res = dispatch_error_to_response(DispatchError::ValidationFailed(
            DomainError::validation("bad email"),
        ));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(res).await["retryable"], false);

        let res = dispatch_error_to_response(DomainError::NotFound.into());
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = dispatch_error_to_response(DispatchError::HandlerNotFound("Nope".into()));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn transient_failures_are_retryable() {
        let res = dispatch_error_to_response(DispatchError::ConcurrencyConflict {
            aggregate_id: AggregateId::parse("user-1").unwrap(),
            expected: ExpectedVersion::Exact(0),
            actual: 1,
        });
        assert!(res.status().is_server_error());
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body(res).await;
        assert_eq!(json["error"], "concurrency_conflict");
        assert_eq!(json["retryable"], true);

        let res = dispatch_error_to_response(DispatchError::StorageUnavailable(
            "database is locked at /var/lib/events.db".into(),
        ));
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body(res).await;
        assert_eq!(json["error"], "storage_unavailable");
        assert_eq!(json["retryable"], true);
        assert!(!json.to_string().contains("events.db"));
    }
}
