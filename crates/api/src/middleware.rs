use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use userserver_core::PrincipalId;

use crate::app::errors::json_error;
use crate::context::PrincipalContext;

/// Claims this service reads from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Principal issuing the request.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// HS256 token verification shared by all requests.
#[derive(Clone)]
pub struct AuthState {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl AuthState {
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: Arc::new(DecodingKey::from_secret(secret)),
            validation: Arc::new(validation),
        }
    }

    pub fn verify(&self, token: &str) -> Result<PrincipalId, StatusCode> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;
        PrincipalId::parse(data.claims.sub).map_err(|_| StatusCode::UNAUTHORIZED)
    }
}

/// Attach a `PrincipalContext` to every request.
///
/// Requests without `Authorization` are anonymous; a header that is present but
/// malformed or carries an invalid token is rejected with 401.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let principal = match extract_bearer(req.headers()) {
        Ok(None) => PrincipalContext::anonymous(),
        Ok(Some(token)) => state
            .verify(token)
            .map(PrincipalContext::authenticated)
            .map_err(unauthorized)?,
        Err(status) => return Err(unauthorized(status)),
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn unauthorized(status: StatusCode) -> Response {
    json_error(status, "unauthorized", "missing or invalid bearer token").into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Result<Option<&str>, StatusCode> {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Ok(None);
    };

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(Some(token))
}
