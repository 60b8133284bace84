//! Session cookies: `accessToken` and `refreshToken`, both httpOnly.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::Duration;

use crate::auth::jwt::{JwtKeys, TokenKind};
use crate::auth::services::SessionTokens;
use crate::config::{CookieConfig, SameSitePolicy};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn same_site(policy: SameSitePolicy) -> SameSite {
    match policy {
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::None => SameSite::None,
    }
}

fn session_cookie(
    name: &'static str,
    value: String,
    max_age: Duration,
    config: &CookieConfig,
) -> Cookie<'static> {
    let mut builder = Cookie::build((name, value))
        .http_only(true)
        .secure(config.secure)
        .same_site(same_site(config.same_site))
        .path("/")
        .max_age(max_age);
    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

pub fn set_session_cookies(
    jar: CookieJar,
    tokens: &SessionTokens,
    keys: &JwtKeys,
    config: &CookieConfig,
) -> CookieJar {
    let access_age = Duration::seconds(keys.ttl(TokenKind::Access).as_secs() as i64);
    let refresh_age = Duration::seconds(keys.ttl(TokenKind::Refresh).as_secs() as i64);
    jar.add(session_cookie(
        ACCESS_COOKIE,
        tokens.access_token.clone(),
        access_age,
        config,
    ))
    .add(session_cookie(
        REFRESH_COOKIE,
        tokens.refresh_token.clone(),
        refresh_age,
        config,
    ))
}

/// Expired, empty cookies with the same scope as the live ones.
pub fn clear_session_cookies(jar: CookieJar, config: &CookieConfig) -> CookieJar {
    jar.add(session_cookie(ACCESS_COOKIE, String::new(), Duration::ZERO, config))
        .add(session_cookie(REFRESH_COOKIE, String::new(), Duration::ZERO, config))
}
