use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::auth::repo::{RepoError, RepoResult, UserStore};
use crate::auth::repo_types::{ChatBoard, NewUser, User};
use crate::auth::tokens::is_unexpired;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    chat_boards: HashMap<Uuid, ChatBoard>,
}

/// Process-local store for development without Postgres, and for tests.
#[derive(Default)]
pub struct MemoryUserStore {
    tables: RwLock<Tables>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    async fn find(&self, pred: impl Fn(&User) -> bool) -> RepoResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| pred(u)).cloned())
    }

    async fn update(&self, id: Uuid, apply: impl FnOnce(&mut User)) -> RepoResult<()> {
        self.update_if(id, |_| true, apply).await?;
        Ok(())
    }

    /// Check and write under one lock, like a conditional `UPDATE ... WHERE`.
    async fn update_if(
        &self,
        id: Uuid,
        guard: impl FnOnce(&User) -> bool,
        apply: impl FnOnce(&mut User),
    ) -> RepoResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.users.get_mut(&id) {
            Some(user) if guard(user) => {
                apply(user);
                user.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        self.find(|u| u.email == email).await
    }

    async fn find_by_login(&self, identifier: &str) -> RepoResult<Option<User>> {
        self.find(|u| u.email == identifier || u.username == identifier).await
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> RepoResult<Option<User>> {
        self.find(|u| u.email == email || u.username == username).await
    }

    async fn find_by_verification_token(&self, token_hash: &str) -> RepoResult<Option<User>> {
        self.find(|u| u.email_verification_token.as_deref() == Some(token_hash))
            .await
    }

    async fn find_by_reset_token(&self, token_hash: &str) -> RepoResult<Option<User>> {
        self.find(|u| u.forgot_password_token.as_deref() == Some(token_hash))
            .await
    }

    #[cfg(test)]
    async fn find_chat_board(&self, id: Uuid) -> RepoResult<Option<ChatBoard>> {
        Ok(self.tables.read().await.chat_boards.get(&id).cloned())
    }

    async fn create_with_chat_board(&self, new_user: NewUser) -> RepoResult<User> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .users
            .values()
            .any(|u| u.email == new_user.email || u.username == new_user.username);
        if taken {
            return Err(RepoError::Duplicate);
        }

        let now = OffsetDateTime::now_utc();
        let user_id = Uuid::new_v4();
        let board = ChatBoard {
            id: Uuid::new_v4(),
            user_id,
        };
        debug!(user_id = %board.user_id, board_id = %board.id, "chat board created");
        let user = User {
            id: user_id,
            email: new_user.email,
            username: new_user.username,
            password_hash: new_user.password_hash,
            is_email_verified: false,
            email_verification_token: None,
            email_verification_token_expires: None,
            forgot_password_token: None,
            forgot_password_expiry: None,
            refresh_token: None,
            chat_board_id: Some(board.id),
            created_at: now,
            updated_at: now,
        };
        tables.chat_boards.insert(board.id, board);
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_email_verification_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()> {
        self.update(id, |u| {
            u.email_verification_token = Some(token_hash.to_string());
            u.email_verification_token_expires = Some(expires);
        })
        .await
    }

    async fn mark_email_verified(&self, id: Uuid) -> RepoResult<()> {
        self.update(id, |u| {
            u.is_email_verified = true;
            u.email_verification_token = None;
            u.email_verification_token_expires = None;
        })
        .await
    }

    async fn set_refresh_token(&self, id: Uuid, token_hash: Option<&str>) -> RepoResult<()> {
        self.update(id, |u| u.refresh_token = token_hash.map(str::to_string))
            .await
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected_hash: &str,
        new_hash: &str,
    ) -> RepoResult<bool> {
        self.update_if(
            id,
            |u| u.refresh_token.as_deref() == Some(expected_hash),
            |u| u.refresh_token = Some(new_hash.to_string()),
        )
        .await
    }

    async fn set_password_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> RepoResult<()> {
        self.update(id, |u| {
            u.forgot_password_token = Some(token_hash.to_string());
            u.forgot_password_expiry = Some(expires);
        })
        .await
    }

    async fn reset_password(
        &self,
        id: Uuid,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<bool> {
        let now = OffsetDateTime::now_utc();
        self.update_if(
            id,
            |u| {
                u.forgot_password_token.as_deref() == Some(token_hash)
                    && is_unexpired(u.forgot_password_expiry, now)
            },
            |u| {
                u.password_hash = password_hash.to_string();
                u.forgot_password_token = None;
                u.forgot_password_expiry = None;
            },
        )
        .await
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> RepoResult<()> {
        self.update(id, |u| u.password_hash = password_hash.to_string())
            .await
    }
}
