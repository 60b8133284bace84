use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// How session cookies are scoped on the client.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: SameSitePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Lax,
    Strict,
    None,
}

impl std::str::FromStr for SameSitePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lax" => Ok(Self::Lax),
            "strict" => Ok(Self::Strict),
            "none" => Ok(Self::None),
            other => anyhow::bail!("unknown same-site policy: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string; the in-memory store is used when absent.
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub cookies: CookieConfig,
    pub mail: Option<MailConfig>,
    /// Base URL of the web client, used to build links in outgoing mail.
    pub client_url: String,
    pub temporary_token_ttl_minutes: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "finvision".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "finvision-users".into()),
            ttl_minutes: env_parse("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
        };
        let cookies = CookieConfig {
            domain: std::env::var("COOKIE_DOMAIN").ok().filter(|v| !v.is_empty()),
            secure: std::env::var("COOKIE_SECURE")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            same_site: std::env::var("COOKIE_SAME_SITE")
                .ok()
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(SameSitePolicy::Lax),
        };
        let mail = match std::env::var("SMTP_URL").ok().filter(|v| !v.is_empty()) {
            Some(smtp_url) => Some(MailConfig {
                smtp_url,
                from_address: std::env::var("MAIL_FROM")
                    .unwrap_or_else(|_| "FinVision <no-reply@finvision.local>".into()),
            }),
            None => None,
        };
        Ok(Self {
            database_url,
            jwt,
            cookies,
            mail,
            client_url: std::env::var("CLIENT_URL")
                .unwrap_or_else(|_| "http://localhost:5173".into()),
            temporary_token_ttl_minutes: env_parse("TEMP_TOKEN_TTL_MINUTES", 20),
        })
    }

    pub fn temporary_token_ttl(&self) -> time::Duration {
        time::Duration::minutes(self.temporary_token_ttl_minutes)
    }

    /// Link to a client page, e.g. `client_link("verify-email", token)`.
    pub fn client_link(&self, page: &str, token: &str) -> String {
        format!("{}/{}/{}", self.client_url.trim_end_matches('/'), page, token)
    }
}

fn env_parse(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
