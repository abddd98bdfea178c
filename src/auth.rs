//! Token extraction from the `Authorization` header.
//!
//! The registry performs no authentication of its own; the header carries
//! the upstream token. Two forms are accepted: Basic, whose password field
//! is the token (the username is ignored — package-manager clients put
//! anything there), and Bearer, whose value is the token verbatim. Absent
//! or malformed authorization is rejected with the `401` challenge.

use crate::error::AppError;
use crate::state::AppState;
use axum::{extract::FromRequestParts, http::header, http::request::Parts};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// The caller's upstream token, extracted per request.
pub struct AuthToken(pub String);

impl FromRequestParts<AppState> for AuthToken {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(token_from_header)
            .map(AuthToken)
            .ok_or(AppError::BadCredential)
    }
}

/// Parse an `Authorization` header value into a token.
pub fn token_from_header(value: &str) -> Option<String> {
    let (scheme, payload) = value.split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "basic" => {
            let decoded = BASE64.decode(payload.trim()).ok()?;
            let credentials = String::from_utf8(decoded).ok()?;
            let (_username, password) = credentials.split_once(':')?;
            Some(password.to_string())
        }
        "bearer" => Some(payload.to_string()),
        _ => None,
    }
}
