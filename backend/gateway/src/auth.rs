//! Caller identity.
//!
//! The proxy sits behind an authenticating front end that forwards the
//! verified user in `X-Remote-User` and groups in `X-Remote-Groups`
//! (repeated or comma separated).

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use relgate_core::{ProxyError, UserInfo};
use tracing::warn;

use crate::server::ApiError;

pub const USER_HEADER: &str = "x-remote-user";
pub const GROUPS_HEADER: &str = "x-remote-groups";

pub struct Identity(pub UserInfo);

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let Some(user) = user else {
            warn!(path = %parts.uri.path(), "Request without user identity");
            return Err(ProxyError::Unauthenticated(format!("missing {USER_HEADER} header")).into());
        };
        let groups = parts
            .headers
            .get_all(GROUPS_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .collect();
        Ok(Identity(UserInfo::new(user, groups)))
    }
}
