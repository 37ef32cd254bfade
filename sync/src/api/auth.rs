//! Bearer token extraction for the session endpoint.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::{AppError, AppState};

/// A caller allowed to open the sync session.
///
/// With `TALLY_AUTH_TOKEN` unset any caller qualifies; otherwise the bearer
/// token must match it.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub token: Option<String>,
}

impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|header| {
                header
                    .strip_prefix("Bearer ")
                    .map(str::trim)
                    .ok_or(AppError::Unauthorized)
            })
            .transpose()?;

        match (&state.config.auth_token, bearer) {
            (None, token) => Ok(SessionUser {
                token: token.map(str::to_string),
            }),
            (Some(expected), Some(token)) if token == expected => Ok(SessionUser {
                token: Some(token.to_string()),
            }),
            (Some(_), _) => {
                tracing::warn!("Session rejected: bad or missing bearer token");
                Err(AppError::Unauthorized)
            }
        }
    }
}
