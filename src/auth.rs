use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// API-key middleware for every inbound route. Accepts the key in
/// `x-api-key` or as a `Bearer` token; comparison is constant-time.
/// When no key is configured the API runs open (local development).
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    // CORS preflights must succeed without credentials.
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let Some(expected_key) = &auth_state.config.api_key else {
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();

    let provided_key = if let Some(value) = headers.get("x-api-key") {
        match value.to_str() {
            Ok(key) => key,
            Err(_) => {
                warn!("Malformed x-api-key header for path: {path}");
                return Err(unauthorized());
            }
        }
    } else if let Some(value) = headers.get("authorization") {
        let auth_str = match value.to_str() {
            Ok(s) => s,
            Err(_) => {
                warn!("Malformed authorization header for path: {path}");
                return Err(unauthorized());
            }
        };
        match auth_str.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                warn!("Authorization header without Bearer prefix for path: {path}");
                return Err(unauthorized());
            }
        }
    } else {
        warn!("Missing API key in request to: {path}");
        return Err(unauthorized());
    };

    // Constant-time comparison keeps key bytes unrecoverable through
    // response timing.
    use subtle::ConstantTimeEq;
    if provided_key
        .as_bytes()
        .ct_eq(expected_key.as_bytes())
        .into()
    {
        Ok(next.run(request).await)
    } else {
        warn!("Authentication failed for path: {path}");
        Err(unauthorized())
    }
}
