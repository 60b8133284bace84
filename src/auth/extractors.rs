use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRef, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;
use uuid::Uuid;

use super::{cookies::ACCESS_COOKIE, jwt::JwtKeys};
use crate::error::AppError;

/// Authenticated user ID, taken from the `accessToken` cookie or an
/// `Authorization: Bearer` header.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        let from_cookie = CookieJar::from_headers(&parts.headers)
            .get(ACCESS_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty());
        let from_header = || {
            parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
                .map(|t| t.trim().to_string())
        };

        let token = from_cookie
            .or_else(from_header)
            .ok_or_else(|| AppError::Auth("Unauthorized request".into()))?;

        let claims = keys.verify_access(&token).map_err(|e| {
            warn!(error = %e, "invalid or expired access token");
            AppError::Auth("Invalid access token".into())
        })?;

        Ok(AuthUser(claims.sub))
    }
}

/// `Json` whose rejections (bad syntax, missing or unknown fields) are 400s
/// in the standard error body.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::Validation(e.body_text()))?;
        Ok(JsonBody(value))
    }
}
