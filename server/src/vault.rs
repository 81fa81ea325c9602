//! The token vault.
//!
//! Tokens are 24 random bytes, base64-url encoded, handed to clients once
//! and stored only as SHA-256 hex hashes. The refresh token is single-use:
//! rotating deletes the old hash before the new pair is issued.

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use tumble_core::error::{Error, Result};
use tumble_core::params::AuthBundle;
use tumble_core::state::{Snapshot, TokenRecord};

pub const ACCESS_TOKEN_TTL_MS: u64 = 15 * 60 * 1000;
pub const REFRESH_TOKEN_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
const TOKEN_BYTES: usize = 24;

#[derive(Debug, Clone)]
pub struct Vault {
    access_ttl_ms: u64,
    refresh_ttl_ms: u64,
}

impl Default for Vault {
    fn default() -> Self {
        Self {
            access_ttl_ms: ACCESS_TOKEN_TTL_MS,
            refresh_ttl_ms: REFRESH_TOKEN_TTL_MS,
        }
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl Vault {
    pub fn new(access_ttl_ms: u64, refresh_ttl_ms: u64) -> Self {
        Self {
            access_ttl_ms,
            refresh_ttl_ms,
        }
    }

    /// Issue a fresh access + refresh pair for the player, optionally bound
    /// to a session.
    pub fn issue_bundle(
        &self,
        snapshot: &mut Snapshot,
        player_id: &str,
        session_id: Option<&str>,
        now: u64,
    ) -> AuthBundle {
        let access_token = generate_token();
        let refresh_token = generate_token();
        let access_expires_at = now + self.access_ttl_ms;
        snapshot.access_tokens.insert(
            hash_token(&access_token),
            TokenRecord {
                player_id: player_id.to_owned(),
                session_id: session_id.map(str::to_owned),
                issued_at: now,
                expires_at: access_expires_at,
            },
        );
        snapshot.refresh_tokens.insert(
            hash_token(&refresh_token),
            TokenRecord {
                player_id: player_id.to_owned(),
                session_id: session_id.map(str::to_owned),
                issued_at: now,
                expires_at: now + self.refresh_ttl_ms,
            },
        );
        AuthBundle {
            access_token,
            refresh_token,
            expires_at: access_expires_at,
        }
    }

    /// Look up an access token. An expired hash is deleted on sight.
    pub fn verify_access(
        &self,
        snapshot: &mut Snapshot,
        token: &str,
        now: u64,
    ) -> Option<TokenRecord> {
        let hash = hash_token(token);
        match snapshot.access_tokens.get(&hash) {
            Some(record) if record.is_expired(now) => {
                snapshot.access_tokens.remove(&hash);
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    pub fn verify_refresh(
        &self,
        snapshot: &mut Snapshot,
        token: &str,
        now: u64,
    ) -> Option<TokenRecord> {
        let hash = hash_token(token);
        match snapshot.refresh_tokens.get(&hash) {
            Some(record) if record.is_expired(now) => {
                snapshot.refresh_tokens.remove(&hash);
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    /// Rotate the pair. The presented refresh hash is consumed whether or
    /// not a new pair is issued.
    pub fn refresh(
        &self,
        snapshot: &mut Snapshot,
        refresh_token: &str,
        now: u64,
    ) -> Result<AuthBundle> {
        let hash = hash_token(refresh_token);
        let record = snapshot
            .refresh_tokens
            .remove(&hash)
            .ok_or_else(|| Error::Unauthorized("unknown refresh token".into()))?;
        if record.is_expired(now) {
            return Err(Error::Unauthorized("refresh token expired".into()));
        }
        Ok(self.issue_bundle(
            snapshot,
            &record.player_id,
            record.session_id.as_deref(),
            now,
        ))
    }

    /// Drop every expired hash. Runs from the periodic cleanup.
    pub fn purge_expired(&self, snapshot: &mut Snapshot, now: u64) -> usize {
        let before = snapshot.access_tokens.len() + snapshot.refresh_tokens.len();
        snapshot.access_tokens.retain(|_, r| !r.is_expired(now));
        snapshot.refresh_tokens.retain(|_, r| !r.is_expired(now));
        before - snapshot.access_tokens.len() - snapshot.refresh_tokens.len()
    }
}
