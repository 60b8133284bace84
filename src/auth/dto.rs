use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::password::check_password;
use crate::auth::repo_types::User;
use crate::error::{AppError, AppResult};

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Request body for user registration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub confirm_password: Option<String>,
}

/// Registration input after normalization and checks.
#[derive(Debug)]
pub struct ValidRegistration {
    pub email: String,
    pub username: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(self) -> AppResult<ValidRegistration> {
        let email = normalize(&self.email);
        if !is_valid_email(&email) {
            return Err(AppError::Validation("Invalid email".into()));
        }
        let username = normalize(&self.username);
        if username.is_empty() {
            return Err(AppError::Validation("Username is required".into()));
        }
        // Login accepts either identifier, so a username must never look like an email.
        if username.contains('@') {
            return Err(AppError::Validation("Username cannot contain '@'".into()));
        }
        check_password(&self.password)?;
        if let Some(confirm) = &self.confirm_password {
            if confirm != &self.password {
                return Err(AppError::Validation("Passwords do not match".into()));
            }
        }
        Ok(ValidRegistration {
            email,
            username,
            password: self.password,
        })
    }
}

/// Request body for login: `{ "userData": { "email", "password" } }`.
/// `email` may carry the username instead.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoginRequest {
    pub user_data: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

impl ResetPasswordRequest {
    pub fn validate(&self) -> AppResult<()> {
        check_password(&self.new_password)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

impl ChangePasswordRequest {
    pub fn validate(&self) -> AppResult<()> {
        check_password(&self.new_password)
    }
}

/// Request body for refresh; the `refreshToken` cookie takes precedence.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Sanitized user returned to clients: no password or token fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub is_email_verified: bool,
    pub chat_board: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&User> for PublicUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            username: u.username.clone(),
            is_email_verified: u.is_email_verified,
            chat_board: u.chat_board_id,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterData {
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailData {
    pub is_email_verified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub user: PublicUser,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    pub access_token: String,
}
