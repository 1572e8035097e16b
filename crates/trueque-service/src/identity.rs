//! Identity extraction from the upstream authentication gateway.
//!
//! The gateway verifies credentials and forwards the pair as `x-user-id`
//! and `x-user-role` headers; this layer trusts them and never re-verifies.

use crate::ApiError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::str::FromStr;
use trueque_core::auth::Identity;
use trueque_storage::{Role, UserId};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Verified caller identity taken from the gateway headers. Absent or
/// malformed headers reject with 401.
pub struct AuthIdentity(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for AuthIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| {
                ApiError::unauthorized(format!("missing or invalid {USER_ID_HEADER} header"))
            })?;
        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Role::from_str(v).ok())
            .ok_or_else(|| {
                ApiError::unauthorized(format!("missing or invalid {USER_ROLE_HEADER} header"))
            })?;
        Ok(Self(Identity::new(UserId(user_id), role)))
    }
}
