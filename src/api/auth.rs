//! Session authentication.
//!
//! A session token is read from the `auth_token` cookie, falling back to an
//! `Authorization: Bearer` header for non-browser clients.

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::debug;

use super::error::ApiError;
use super::state::AppState;
use crate::error::Error;
use crate::storage::User;

pub const SESSION_COOKIE: &str = "auth_token";

/// The session token carried by a request, if any.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string());

    from_cookie.filter(|t| !t.is_empty()).or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// The authenticated user. Rejects the request with 401 otherwise.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers)
            .ok_or_else(|| Error::Unauthorized("authentication required".into()))?;
        match state.users.user_for_token(&token, state.clock.now())? {
            Some(user) => Ok(Self(user)),
            None => {
                debug!("Rejected unknown or expired session");
                Err(Error::Unauthorized("invalid or expired session".into()).into())
            }
        }
    }
}
