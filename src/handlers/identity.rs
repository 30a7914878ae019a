//! Caller identity extraction.
//!
//! Authentication happens upstream. The gateway forwards the caller as
//! `X-User-Id` (UUID) and optionally `X-User-Role` (defaults to `user`).

use crate::{
    errors::AppError,
    models::identity::{Identity, Role},
};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, request::Parts},
};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::bad_request(format!("{} is not valid text", name)))
        })
        .transpose()
}

/// `Ok(None)` when no user id header is present at all.
pub fn identity_from_headers(headers: &HeaderMap) -> Result<Option<Identity>, AppError> {
    let Some(raw_id) = header_str(headers, USER_ID_HEADER)? else {
        return Ok(None);
    };
    let user_id = Uuid::parse_str(raw_id.trim())
        .map_err(|_| AppError::unauthorized(format!("{} is not a valid id", USER_ID_HEADER)))?;
    let role = match header_str(headers, USER_ROLE_HEADER)? {
        Some(raw) => raw
            .parse::<Role>()
            .map_err(|err| AppError::bad_request(err.to_string()))?,
        None => Role::default(),
    };
    Ok(Some(Identity { user_id, role }))
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers)?
            .ok_or_else(|| AppError::unauthorized("authentication required"))
    }
}

impl<S> OptionalFromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        identity_from_headers(&parts.headers)
    }
}
