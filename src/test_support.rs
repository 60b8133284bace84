//! Shared fixtures for unit and router tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;

use crate::auth::memory::MemoryUserStore;
use crate::config::{AppConfig, CookieConfig, JwtConfig, SameSitePolicy};
use crate::mailer::{EmailMessage, Mailer};
use crate::state::AppState;

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: None,
        jwt: JwtConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        },
        cookies: CookieConfig {
            domain: None,
            secure: true,
            same_site: SameSitePolicy::Lax,
        },
        mail: None,
        client_url: "http://localhost:5173".into(),
        temporary_token_ttl_minutes: 20,
    }
}

/// Captures outgoing mail instead of delivering it.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    fail: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> EmailMessage {
        self.sent().pop().expect("no mail was sent")
    }

    /// Makes the next delivery fail.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, message: EmailMessage) -> anyhow::Result<()> {
        if self.fail.swap(false, Ordering::SeqCst) {
            anyhow::bail!("smtp unavailable");
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryUserStore>,
    pub mailer: Arc<RecordingMailer>,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(MemoryUserStore::new());
        let mailer = Arc::new(RecordingMailer::default());
        let state = AppState::from_parts(store.clone(), mailer.clone(), Arc::new(test_config()));
        Self {
            state,
            store,
            mailer,
        }
    }
}

/// Pulls the hex token that follows `marker` out of a mail body.
pub fn token_from_link(text: &str, marker: &str) -> String {
    let start = text.find(marker).expect("link marker in mail") + marker.len();
    text[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect()
}
