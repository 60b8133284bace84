//! Account flows: registration, email verification, login/logout, session
//! refresh and password recovery.

use anyhow::anyhow;
use axum::extract::FromRef;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            normalize, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, PublicUser,
            RegisterRequest, ResetPasswordRequest,
        },
        jwt::JwtKeys,
        password::{hash_password, verify_password},
        repo_types::{NewUser, User},
        tokens::{generate_temporary_token, hash_token, is_unexpired},
    },
    error::{AppError, AppResult},
    mailer::EmailMessage,
    state::AppState,
};

const INVALID_VERIFICATION_TOKEN: &str = "Invalid or expired email verification token";
const INVALID_RESET_TOKEN: &str = "Token is invalid or expired";
const INVALID_REFRESH_TOKEN: &str = "Refresh token is expired or used";

#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub user: PublicUser,
    pub tokens: SessionTokens,
}

/// Create the account and its chat board, then mail a verification link.
pub async fn register(state: &AppState, req: RegisterRequest) -> AppResult<PublicUser> {
    let input = req.validate()?;

    if state
        .store
        .find_by_email_or_username(&input.email, &input.username)
        .await?
        .is_some()
    {
        warn!(email = %input.email, username = %input.username, "user already exists");
        return Err(AppError::Conflict("User with email or username already exists".into()));
    }

    let password_hash = hash_password(&input.password)?;
    let user = state
        .store
        .create_with_chat_board(NewUser {
            email: input.email,
            username: input.username,
            password_hash,
        })
        .await?;

    send_verification_email(state, &user).await?;

    let created = state
        .store
        .find_by_id(user.id)
        .await?
        .ok_or_else(|| anyhow!("Something went wrong while registering the user"))?;

    info!(user_id = %created.id, email = %created.email, "user registered");
    Ok(PublicUser::from(&created))
}

/// Issue a fresh verification token (replacing any outstanding one) and mail it.
async fn send_verification_email(state: &AppState, user: &User) -> AppResult<()> {
    let token = generate_temporary_token(state.config.temporary_token_ttl());
    state
        .store
        .set_email_verification_token(user.id, &token.hashed, token.expires_at)
        .await?;

    let url = state.config.client_link("verify-email", &token.unhashed);
    state
        .mailer
        .send_email(EmailMessage {
            email: user.email.clone(),
            subject: "Email Verification".into(),
            text: format!("Please verify your email by clicking on the link below: {url}"),
        })
        .await?;
    Ok(())
}

pub async fn verify_email(state: &AppState, token: &str) -> AppResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::Validation("Email verification token is missing".into()));
    }

    let user = state
        .store
        .find_by_verification_token(&hash_token(token))
        .await?
        .ok_or_else(|| AppError::Validation(INVALID_VERIFICATION_TOKEN.into()))?;

    if !is_unexpired(user.email_verification_token_expires, OffsetDateTime::now_utc()) {
        warn!(user_id = %user.id, "expired email verification token");
        return Err(AppError::Validation(INVALID_VERIFICATION_TOKEN.into()));
    }

    state.store.mark_email_verified(user.id).await?;
    info!(user_id = %user.id, "email verified");
    Ok(())
}

pub async fn resend_email_verification(state: &AppState, user_id: Uuid) -> AppResult<()> {
    let user = state
        .store
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".into()))?;
    if user.is_email_verified {
        return Err(AppError::Conflict("Email is already verified".into()));
    }
    send_verification_email(state, &user).await?;
    info!(user_id = %user.id, "verification email re-sent");
    Ok(())
}

fn sign_session(state: &AppState, user_id: Uuid) -> AppResult<SessionTokens> {
    let keys = JwtKeys::from_ref(state);
    Ok(SessionTokens {
        access_token: keys.sign_access(user_id)?,
        refresh_token: keys.sign_refresh(user_id)?,
    })
}

/// Sign a new access/refresh pair and make the refresh token the only valid one.
async fn issue_session(state: &AppState, user_id: Uuid) -> AppResult<SessionTokens> {
    let tokens = sign_session(state, user_id)?;
    state
        .store
        .set_refresh_token(user_id, Some(&hash_token(&tokens.refresh_token)))
        .await?;
    Ok(tokens)
}

pub async fn login(state: &AppState, req: LoginRequest) -> AppResult<LoginOutcome> {
    let creds = req
        .user_data
        .ok_or_else(|| AppError::Validation("User data is required".into()))?;
    let identifier = creds
        .email
        .as_deref()
        .map(normalize)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation("Email is required".into()))?;
    let password = creds
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::Validation("Password is required".into()))?;

    let user = state
        .store
        .find_by_login(&identifier)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".into()))?;

    if !verify_password(&password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Auth("Invalid user credentials".into()));
    }

    let tokens = issue_session(state, user.id).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(LoginOutcome {
        user: PublicUser::from(&user),
        tokens,
    })
}

pub async fn logout(state: &AppState, user_id: Uuid) -> AppResult<()> {
    state.store.set_refresh_token(user_id, None).await?;
    info!(user_id = %user_id, "user logged out");
    Ok(())
}

pub async fn current_user(state: &AppState, user_id: Uuid) -> AppResult<PublicUser> {
    let user = state
        .store
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::Auth("Invalid access token".into()))?;
    Ok(PublicUser::from(&user))
}

/// Exchange the current refresh token for a new pair. Any other token,
/// including one replaced by a later login or cleared by logout, is refused.
pub async fn refresh_session(state: &AppState, refresh_token: &str) -> AppResult<SessionTokens> {
    let keys = JwtKeys::from_ref(state);
    let claims = keys.verify_refresh(refresh_token).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        AppError::Auth("Invalid refresh token".into())
    })?;

    let tokens = sign_session(state, claims.sub)?;
    let rotated = state
        .store
        .rotate_refresh_token(
            claims.sub,
            &hash_token(refresh_token),
            &hash_token(&tokens.refresh_token),
        )
        .await?;
    if !rotated {
        warn!(user_id = %claims.sub, "stale refresh token presented");
        return Err(AppError::Auth(INVALID_REFRESH_TOKEN.into()));
    }
    Ok(tokens)
}

pub async fn forgot_password(state: &AppState, req: ForgotPasswordRequest) -> AppResult<()> {
    let email = normalize(&req.email);
    let user = state
        .store
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".into()))?;

    let token = generate_temporary_token(state.config.temporary_token_ttl());
    state
        .store
        .set_password_reset_token(user.id, &token.hashed, token.expires_at)
        .await?;

    let url = state.config.client_link("reset-password", &token.unhashed);
    state
        .mailer
        .send_email(EmailMessage {
            email: user.email.clone(),
            subject: "Reset Password".into(),
            text: format!(
                "To reset your password, open this link:\n{url}\n\n\
                 If you did not request a password reset, you can ignore this email."
            ),
        })
        .await?;
    info!(user_id = %user.id, "password reset requested");
    Ok(())
}

pub async fn reset_password(
    state: &AppState,
    token: &str,
    req: ResetPasswordRequest,
) -> AppResult<()> {
    let token_hash = hash_token(token.trim());
    let user = state
        .store
        .find_by_reset_token(&token_hash)
        .await?
        .ok_or_else(|| AppError::Validation(INVALID_RESET_TOKEN.into()))?;

    if !is_unexpired(user.forgot_password_expiry, OffsetDateTime::now_utc()) {
        warn!(user_id = %user.id, "expired password reset token");
        return Err(AppError::Validation(INVALID_RESET_TOKEN.into()));
    }
    req.validate()?;

    let password_hash = hash_password(&req.new_password)?;
    let consumed = state
        .store
        .reset_password(user.id, &token_hash, &password_hash)
        .await?;
    if !consumed {
        warn!(user_id = %user.id, "password reset token already used");
        return Err(AppError::Validation(INVALID_RESET_TOKEN.into()));
    }
    info!(user_id = %user.id, "password reset");
    Ok(())
}

pub async fn change_password(
    state: &AppState,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> AppResult<()> {
    let user = state
        .store
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::Auth("Invalid access token".into()))?;

    if !verify_password(&req.old_password, &user.password_hash)? {
        warn!(user_id = %user.id, "change password with wrong old password");
        return Err(AppError::Validation("Invalid old password".into()));
    }
    req.validate()?;

    let password_hash = hash_password(&req.new_password)?;
    state.store.set_password_hash(user.id, &password_hash).await?;
    info!(user_id = %user.id, "password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::dto::Credentials;
    use crate::auth::repo::UserStore;
    use crate::test_support::{token_from_link, TestApp};

    fn registration(email: &str, username: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            username: username.into(),
            password: "Secret123!".into(),
            confirm_password: None,
        }
    }

    fn login_request(identifier: &str, password: &str) -> LoginRequest {
        LoginRequest {
            user_data: Some(Credentials {
                email: Some(identifier.into()),
                password: Some(password.into()),
            }),
        }
    }

    async fn registered(app: &TestApp) -> PublicUser {
        register(&app.state, registration("a@x.com", "a"))
            .await
            .expect("register")
    }

    #[tokio::test]
    async fn register_creates_unverified_user_with_chat_board() {
        let app = TestApp::new();
        let user = registered(&app).await;
        assert!(!user.is_email_verified);

        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        let board_id = stored.chat_board_id.expect("persisted chat board reference");
        assert_eq!(user.chat_board, Some(board_id));
        let board = app.store.find_chat_board(board_id).await.unwrap().unwrap();
        assert_eq!(board.user_id, user.id);

        assert!(stored.email_verification_token.is_some());
        assert!(stored.email_verification_token_expires.is_some());
    }

    #[tokio::test]
    async fn register_mails_cleartext_token_and_stores_only_hash() {
        let app = TestApp::new();
        let user = registered(&app).await;

        let sent = app.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].email, "a@x.com");
        assert_eq!(sent[0].subject, "Email Verification");
        let token = token_from_link(&sent[0].text, "/verify-email/");

        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        let stored_hash = stored.email_verification_token.unwrap();
        assert_ne!(stored_hash, token);
        assert_eq!(stored_hash, hash_token(&token));
    }

    #[tokio::test]
    async fn duplicate_registration_halts_before_creation() {
        let app = TestApp::new();
        registered(&app).await;

        let same_email = register(&app.state, registration("a@x.com", "other")).await;
        assert!(matches!(same_email, Err(AppError::Conflict(_))));
        let same_username = register(&app.state, registration("b@x.com", "a")).await;
        assert!(matches!(same_username, Err(AppError::Conflict(_))));

        assert_eq!(app.store.user_count().await, 1);
        assert_eq!(app.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn mailer_failure_propagates() {
        let app = TestApp::new();
        app.mailer.fail_next();
        let err = register(&app.state, registration("a@x.com", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn verification_token_is_single_use() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let token = token_from_link(&app.mailer.last().text, "/verify-email/");

        verify_email(&app.state, &token).await.expect("first verify");
        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.is_email_verified);
        assert!(stored.email_verification_token.is_none());
        assert!(stored.email_verification_token_expires.is_none());

        let again = verify_email(&app.state, &token).await;
        assert!(matches!(again, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn expired_verification_token_is_rejected_even_if_hash_matches() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let past = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        app.store
            .set_email_verification_token(user.id, &hash_token("stale"), past)
            .await
            .unwrap();

        let err = verify_email(&app.state, "stale").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m == INVALID_VERIFICATION_TOKEN));
        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(!stored.is_email_verified);
    }

    #[tokio::test]
    async fn verify_rejects_missing_and_unknown_tokens() {
        let app = TestApp::new();
        assert!(matches!(
            verify_email(&app.state, "  ").await,
            Err(AppError::Validation(ref m)) if m.contains("missing")
        ));
        assert!(matches!(
            verify_email(&app.state, "deadbeef").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn resend_replaces_outstanding_token() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let first = token_from_link(&app.mailer.last().text, "/verify-email/");

        resend_email_verification(&app.state, user.id).await.unwrap();
        let second = token_from_link(&app.mailer.last().text, "/verify-email/");
        assert_ne!(first, second);

        assert!(verify_email(&app.state, &first).await.is_err());
        verify_email(&app.state, &second).await.unwrap();

        let err = resend_email_verification(&app.state, user.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn login_validates_payload() {
        let app = TestApp::new();
        let no_data = login(&app.state, LoginRequest { user_data: None }).await;
        assert!(matches!(no_data, Err(AppError::Validation(ref m)) if m == "User data is required"));

        let no_email = login(
            &app.state,
            LoginRequest {
                user_data: Some(Credentials {
                    email: None,
                    password: Some("x".into()),
                }),
            },
        )
        .await;
        assert!(matches!(no_email, Err(AppError::Validation(ref m)) if m == "Email is required"));
    }

    #[tokio::test]
    async fn login_distinguishes_unknown_user_and_bad_password() {
        let app = TestApp::new();
        registered(&app).await;

        let unknown = login(&app.state, login_request("nobody@x.com", "Secret123!")).await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));

        let bad = login(&app.state, login_request("a@x.com", "wrong-password")).await;
        assert!(matches!(bad, Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn login_accepts_username_and_stores_refresh_hash() {
        let app = TestApp::new();
        let user = registered(&app).await;

        let outcome = login(&app.state, login_request("A", "Secret123!")).await.unwrap();
        assert_eq!(outcome.user.id, user.id);

        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(
            stored.refresh_token.as_deref(),
            Some(hash_token(&outcome.tokens.refresh_token).as_str())
        );
    }

    #[tokio::test]
    async fn second_login_invalidates_earlier_refresh_token() {
        let app = TestApp::new();
        registered(&app).await;

        let first = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();
        let second = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();
        assert_ne!(first.tokens.refresh_token, second.tokens.refresh_token);

        let stale = refresh_session(&app.state, &first.tokens.refresh_token).await;
        assert!(matches!(stale, Err(AppError::Auth(_))));
        refresh_session(&app.state, &second.tokens.refresh_token)
            .await
            .expect("current token refreshes");
    }

    #[tokio::test]
    async fn refresh_rotates_token() {
        let app = TestApp::new();
        registered(&app).await;
        let outcome = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();

        let rotated = refresh_session(&app.state, &outcome.tokens.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, outcome.tokens.refresh_token);
        assert!(refresh_session(&app.state, &outcome.tokens.refresh_token).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_with_one_token_succeed_once() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let outcome = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let state = app.state.clone();
                let token = outcome.tokens.refresh_token.clone();
                tokio::spawn(async move { refresh_session(&state, &token).await })
            })
            .collect();

        let mut winners = Vec::new();
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(tokens) => winners.push(tokens),
                Err(err) => assert!(matches!(err, AppError::Auth(_))),
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(
            stored.refresh_token.as_deref(),
            Some(hash_token(&winners[0].refresh_token).as_str())
        );
    }

    #[tokio::test]
    async fn refresh_rejects_access_token() {
        let app = TestApp::new();
        registered(&app).await;
        let outcome = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();
        let err = refresh_session(&app.state, &outcome.tokens.access_token).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn logout_clears_refresh_token_and_blocks_refresh() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let outcome = login(&app.state, login_request("a@x.com", "Secret123!")).await.unwrap();

        logout(&app.state, user.id).await.unwrap();
        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.refresh_token.is_none());

        let err = refresh_session(&app.state, &outcome.tokens.refresh_token).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn forgot_password_for_unknown_email_is_not_found_and_sends_nothing() {
        let app = TestApp::new();
        let err = forgot_password(
            &app.state,
            ForgotPasswordRequest {
                email: "ghost@x.com".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(app.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn reset_password_replaces_password_and_burns_token() {
        let app = TestApp::new();
        let user = registered(&app).await;
        forgot_password(&app.state, ForgotPasswordRequest { email: "A@x.com".into() })
            .await
            .unwrap();
        let mail = app.mailer.last();
        assert_eq!(mail.subject, "Reset Password");
        let token = token_from_link(&mail.text, "/reset-password/");

        let req = || ResetPasswordRequest {
            new_password: "NewSecret456!".into(),
        };
        reset_password(&app.state, &token, req()).await.unwrap();

        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.forgot_password_token.is_none());
        assert!(stored.forgot_password_expiry.is_none());
        assert!(verify_password("NewSecret456!", &stored.password_hash).unwrap());

        let reuse = reset_password(&app.state, &token, req()).await;
        assert!(matches!(reuse, Err(AppError::Validation(ref m)) if m == INVALID_RESET_TOKEN));

        login(&app.state, login_request("a@x.com", "NewSecret456!"))
            .await
            .expect("login with new password");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resets_with_one_token_succeed_once() {
        let app = TestApp::new();
        registered(&app).await;
        forgot_password(&app.state, ForgotPasswordRequest { email: "a@x.com".into() })
            .await
            .unwrap();
        let token = token_from_link(&app.mailer.last().text, "/reset-password/");

        let attempts: Vec<_> = (0..4)
            .map(|i| {
                let state = app.state.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    reset_password(
                        &state,
                        &token,
                        ResetPasswordRequest {
                            new_password: format!("NewSecret45{i}!"),
                        },
                    )
                    .await
                })
            })
            .collect();

        let mut successes = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => successes += 1,
                Err(err) => {
                    assert!(matches!(err, AppError::Validation(ref m) if m == INVALID_RESET_TOKEN))
                }
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn expired_reset_token_is_rejected() {
        let app = TestApp::new();
        let user = registered(&app).await;
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        app.store
            .set_password_reset_token(user.id, &hash_token("old"), past)
            .await
            .unwrap();

        let err = reset_password(
            &app.state,
            "old",
            ResetPasswordRequest {
                new_password: "NewSecret456!".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let stored = app.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(verify_password("Secret123!", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn change_password_requires_old_password() {
        let app = TestApp::new();
        let user = registered(&app).await;

        let wrong = change_password(
            &app.state,
            user.id,
            ChangePasswordRequest {
                old_password: "nope-nope".into(),
                new_password: "NewSecret456!".into(),
            },
        )
        .await;
        assert!(matches!(wrong, Err(AppError::Validation(_))));

        change_password(
            &app.state,
            user.id,
            ChangePasswordRequest {
                old_password: "Secret123!".into(),
                new_password: "NewSecret456!".into(),
            },
        )
        .await
        .unwrap();
        login(&app.state, login_request("a", "NewSecret456!")).await.unwrap();
    }
}
