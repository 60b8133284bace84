use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database. Deliberately not `Serialize`: clients only
/// ever see [`super::dto::PublicUser`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: String,                                   // argon2 PHC string
    pub is_email_verified: bool,
    pub email_verification_token: Option<String>,                // sha256 hex
    pub email_verification_token_expires: Option<OffsetDateTime>,
    pub forgot_password_token: Option<String>,                   // sha256 hex
    pub forgot_password_expiry: Option<OffsetDateTime>,
    pub refresh_token: Option<String>,                           // sha256 hex of the JWT
    pub chat_board_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields supplied when registering.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
}

/// Conversation record owned 1:1 by a user.
#[derive(Debug, Clone, FromRow)]
pub struct ChatBoard {
    pub id: Uuid,
    pub user_id: Uuid,
}
