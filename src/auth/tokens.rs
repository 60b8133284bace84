//! One-time tokens for email verification and password reset.
//!
//! Only the SHA-256 hash of a token is stored. The cleartext goes out by mail
//! and is hashed again on the way back in.

use rand::RngCore;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

const TOKEN_BYTES: usize = 20;

#[derive(Debug, Clone)]
pub struct TemporaryToken {
    pub unhashed: String,
    pub hashed: String,
    pub expires_at: OffsetDateTime,
}

pub fn generate_temporary_token(ttl: Duration) -> TemporaryToken {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let unhashed = hex::encode(bytes);
    let hashed = hash_token(&unhashed);
    TemporaryToken {
        unhashed,
        hashed,
        expires_at: OffsetDateTime::now_utc() + ttl,
    }
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// A missing expiry counts as expired.
pub fn is_unexpired(expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    matches!(expires_at, Some(exp) if exp > now)
}
