use axum::{
    extract::{FromRef, Path, State},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::{json, Value};
use tracing::instrument;

use crate::{
    auth::{
        cookies::{clear_session_cookies, set_session_cookies, REFRESH_COOKIE},
        dto::{
            ChangePasswordRequest, ForgotPasswordRequest, LoginData, LoginRequest, PublicUser,
            RefreshData, RefreshRequest, RegisterData, RegisterRequest, ResetPasswordRequest,
            VerifyEmailData,
        },
        extractors::{AuthUser, JsonBody},
        jwt::JwtKeys,
        services,
    },
    error::{AppError, AppResult},
    response::ApiResponse,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/verify-email/:token", get(verify_email))
        .route("/login", post(login))
        .route("/refresh-token", post(refresh_token))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password/:token", post(reset_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/logout", post(logout))
        .route("/resend-email-verification", post(resend_email_verification))
        .route("/change-password", post(change_password))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> AppResult<ApiResponse<RegisterData>> {
    let user = services::register(&state, payload).await?;
    Ok(ApiResponse::created(
        RegisterData { user },
        "User registered successfully and verification email has been sent to your email.",
    ))
}

#[instrument(skip(state, token))]
pub async fn verify_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<ApiResponse<VerifyEmailData>> {
    services::verify_email(&state, &token).await?;
    Ok(ApiResponse::ok(
        VerifyEmailData {
            is_email_verified: true,
        },
        "Email verified successfully",
    ))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> AppResult<(CookieJar, ApiResponse<LoginData>)> {
    let outcome = services::login(&state, payload).await?;
    let keys = JwtKeys::from_ref(&state);
    let jar = set_session_cookies(jar, &outcome.tokens, &keys, &state.config.cookies);
    Ok((
        jar,
        ApiResponse::ok(
            LoginData {
                user: outcome.user,
                access_token: outcome.tokens.access_token,
            },
            "User logged in successfully",
        ),
    ))
}

#[instrument(skip(state, jar))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    jar: CookieJar,
) -> AppResult<(CookieJar, ApiResponse<Value>)> {
    services::logout(&state, user_id).await?;
    let jar = clear_session_cookies(jar, &state.config.cookies);
    Ok((jar, ApiResponse::ok(json!({}), "User logged out successfully")))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<ApiResponse<PublicUser>> {
    let user = services::current_user(&state, user_id).await?;
    Ok(ApiResponse::ok(user, "Current user fetched successfully"))
}

#[instrument(skip(state, jar, payload))]
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Option<JsonBody<RefreshRequest>>,
) -> AppResult<(CookieJar, ApiResponse<RefreshData>)> {
    let presented = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| payload.and_then(|JsonBody(body)| body.refresh_token))
        .ok_or_else(|| AppError::Auth("Unauthorized request".into()))?;

    let tokens = services::refresh_session(&state, &presented).await?;
    let keys = JwtKeys::from_ref(&state);
    let jar = set_session_cookies(jar, &tokens, &keys, &state.config.cookies);
    Ok((
        jar,
        ApiResponse::ok(
            RefreshData {
                access_token: tokens.access_token,
            },
            "Access token refreshed",
        ),
    ))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ForgotPasswordRequest>,
) -> AppResult<ApiResponse<Value>> {
    services::forgot_password(&state, payload).await?;
    Ok(ApiResponse::ok(
        json!({}),
        "Password reset mail has been sent on your email",
    ))
}

#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    JsonBody(payload): JsonBody<ResetPasswordRequest>,
) -> AppResult<ApiResponse<Value>> {
    services::reset_password(&state, &token, payload).await?;
    Ok(ApiResponse::ok(json!({}), "Password reset successfully"))
}

#[instrument(skip(state))]
pub async fn resend_email_verification(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<ApiResponse<Value>> {
    services::resend_email_verification(&state, user_id).await?;
    Ok(ApiResponse::ok(
        json!({}),
        "Mail has been sent to your mail ID",
    ))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> AppResult<ApiResponse<Value>> {
    services::change_password(&state, user_id, payload).await?;
    Ok(ApiResponse::ok(json!({}), "Password changed successfully"))
}
