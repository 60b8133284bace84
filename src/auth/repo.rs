use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::auth::repo_types::{ChatBoard, NewUser, User};

#[derive(Debug, Error)]
pub enum RepoError {
    /// Email or username already taken.
    #[error("duplicate user")]
    Duplicate,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence for user records. Every mutation is a single atomic update
/// of one user row.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    /// Match `identifier` against either the email or the username.
    async fn find_by_login(&self, identifier: &str) -> RepoResult<Option<User>>;
    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> RepoResult<Option<User>>;
    async fn find_by_verification_token(&self, token_hash: &str) -> RepoResult<Option<User>>;
    async fn find_by_reset_token(&self, token_hash: &str) -> RepoResult<Option<User>>;
    #[cfg(test)]
    async fn find_chat_board(&self, id: Uuid) -> RepoResult<Option<ChatBoard>>;

    /// Create the user together with its chat board; the returned record
    /// already references the board.
    async fn create_with_chat_board(&self, new_user: NewUser) -> RepoResult<User>;

    async fn set_email_verification_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()>;
    /// Set the verified flag and clear the verification token fields.
    async fn mark_email_verified(&self, id: Uuid) -> RepoResult<()>;
    async fn set_refresh_token(&self, id: Uuid, token_hash: Option<&str>) -> RepoResult<()>;
    /// Swap the stored refresh hash for `new_hash` only while it still equals
    /// `expected_hash`. Returns false when another rotation or a logout won.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected_hash: &str,
        new_hash: &str,
    ) -> RepoResult<bool>;
    async fn set_password_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()>;
    /// Consume the reset token: replace the password hash and clear the reset
    /// fields, but only while `token_hash` is still stored and unexpired.
    /// Returns false when the token was already used or has expired.
    async fn reset_password(
        &self,
        id: Uuid,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<bool>;
    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> RepoResult<()>;
}

const USER_COLUMNS: &str = "id, email, username, password_hash, is_email_verified, \
     email_verification_token, email_verification_token_expires, \
     forgot_password_token, forgot_password_expiry, refresh_token, chat_board_id, \
     created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_where(&self, condition: &str, value: &str) -> RepoResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {condition}");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}

fn map_insert_error(e: sqlx::Error) -> RepoError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Duplicate,
        _ => RepoError::Database(e),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        self.find_where("email = $1", email).await
    }

    async fn find_by_login(&self, identifier: &str) -> RepoResult<Option<User>> {
        self.find_where("email = $1 OR username = $1", identifier).await
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> RepoResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 OR username = $2 LIMIT 1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .bind(username)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_verification_token(&self, token_hash: &str) -> RepoResult<Option<User>> {
        self.find_where("email_verification_token = $1", token_hash).await
    }

    async fn find_by_reset_token(&self, token_hash: &str) -> RepoResult<Option<User>> {
        self.find_where("forgot_password_token = $1", token_hash).await
    }

    #[cfg(test)]
    async fn find_chat_board(&self, id: Uuid) -> RepoResult<Option<ChatBoard>> {
        let board = sqlx::query_as::<_, ChatBoard>(
            r#"SELECT id, user_id FROM chat_boards WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(board)
    }

    async fn create_with_chat_board(&self, new_user: NewUser) -> RepoResult<User> {
        let mut tx = self.db.begin().await?;

        let user_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, password_hash)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(&new_user.email)
        .bind(&new_user.username)
        .bind(&new_user.password_hash)
        .execute(&mut *tx)
        .await
        .map_err(map_insert_error)?;

        let board = sqlx::query_as::<_, ChatBoard>(
            r#"INSERT INTO chat_boards (id, user_id) VALUES ($1, $2) RETURNING id, user_id"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        debug!(user_id = %board.user_id, board_id = %board.id, "chat board created");

        let sql = format!(
            "UPDATE users SET chat_board_id = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .bind(board.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user)
    }

    async fn set_email_verification_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET email_verification_token = $2,
                   email_verification_token_expires = $3,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(expires)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET is_email_verified = TRUE,
                   email_verification_token = NULL,
                   email_verification_token_expires = NULL,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_refresh_token(&self, id: Uuid, token_hash: Option<&str>) -> RepoResult<()> {
        sqlx::query(r#"UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .bind(token_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected_hash: &str,
        new_hash: &str,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET refresh_token = $3,
                   updated_at = now()
             WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected_hash)
        .bind(new_hash)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_password_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET forgot_password_token = $2,
                   forgot_password_expiry = $3,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(expires)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn reset_password(
        &self,
        id: Uuid,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $2,
                   forgot_password_token = NULL,
                   forgot_password_expiry = NULL,
                   updated_at = now()
             WHERE id = $1
               AND forgot_password_token = $3
               AND forgot_password_expiry > now()
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .bind(token_hash)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> RepoResult<()> {
        sqlx::query(r#"UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
