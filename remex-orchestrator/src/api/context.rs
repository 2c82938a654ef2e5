//! Caller context
//!
//! The gateway in front of the orchestrator authenticates users and
//! forwards who they are and what they may do in headers.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::api::error::ApiError;
use crate::service::permissions::Context;

pub const USER_HEADER: &str = "x-remex-user";
pub const ADMIN_HEADER: &str = "x-remex-admin";
/// Comma separated `resourceType:operation` pairs
pub const PERMISSIONS_HEADER: &str = "x-remex-permissions";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|value| value.to_str().ok())
}

impl<S> FromRequestParts<S> for Context
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if header(parts, ADMIN_HEADER) == Some("true") {
            return Ok(Context::admin());
        }

        let user_id = header(parts, USER_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("caller not identified".to_string()))?
            .trim()
            .parse::<i64>()
            .map_err(|_| ApiError::Unauthorized("malformed user id".to_string()))?;

        let granted = header(parts, PERMISSIONS_HEADER)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        Ok(Context::user(user_id, granted))
    }
}
