use std::sync::Arc;

use crate::auth::memory::MemoryUserStore;
use crate::auth::repo::{PgUserStore, UserStore};
use crate::config::AppConfig;
use crate::db;
use crate::mailer::{LogMailer, Mailer, SmtpMailer};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub mailer: Arc<dyn Mailer>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store = match &config.database_url {
            Some(url) => {
                let pool = db::connect(url).await?;
                Arc::new(PgUserStore::new(pool)) as Arc<dyn UserStore>
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory user store");
                Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>
            }
        };

        let mailer = match &config.mail {
            Some(mail) => Arc::new(SmtpMailer::new(mail)?) as Arc<dyn Mailer>,
            None => Arc::new(LogMailer) as Arc<dyn Mailer>,
        };

        Ok(Self::from_parts(store, mailer, config))
    }

    pub fn from_parts(
        store: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }
}
