/// Refresh-token lifecycle: generate, lookup, rotate, revoke.
///
/// A token is Active from creation until it is revoked (explicitly or
/// by rotation) or its expiry passes. Rotation consumes the presented
/// token and produces exactly one replacement, so at most one live
/// chain descends from a given login.
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::auth::store::{RefreshToken, TokenStore};
use crate::error::{AppError, AuthError, StoreError};

/// 384 bits of CSPRNG output per token, above the 256-bit floor.
const TOKEN_BYTES: usize = 48;

/// Collisions are not expected at this entropy; the bound exists so a
/// broken store cannot loop forever.
const MAX_GENERATE_ATTEMPTS: u32 = 3;

/// Draw a fresh opaque token value: random bytes, base64 url-safe.
fn generate_token_value() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct RefreshTokenManager {
    store: Arc<dyn TokenStore>,
    refresh_token_lifetime: chrono::Duration,
}

impl RefreshTokenManager {
    pub fn new(store: Arc<dyn TokenStore>, refresh_token_lifetime: chrono::Duration) -> Self {
        Self {
            store,
            refresh_token_lifetime,
        }
    }

    fn new_record(&self, user_id: Uuid, now: DateTime<Utc>) -> RefreshToken {
        RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token: generate_token_value(),
            created_at: now,
            expires_at: now + self.refresh_token_lifetime,
            revoked: false,
        }
    }

    /// Create and persist a new Active token for `user_id`. A value
    /// collision in the store triggers regeneration, never silence.
    pub async fn generate(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RefreshToken, AppError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let record = self.new_record(user_id, now);
            match self.store.insert(&record).await {
                Ok(()) => return Ok(record),
                Err(StoreError::UniqueViolation(msg)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        attempt = attempts,
                        "Refresh token value collision, regenerating"
                    );
                    if attempts >= MAX_GENERATE_ATTEMPTS {
                        return Err(StoreError::UniqueViolation(msg).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pure read, exact match on the token value. Callers apply the
    /// Active check themselves via `RefreshToken::is_active`.
    pub async fn lookup(&self, token_value: &str) -> Result<Option<RefreshToken>, AppError> {
        Ok(self.store.find_by_token(token_value).await?)
    }

    /// Consume `token_value` and return `(revoked old, replacement)`.
    ///
    /// Fails with `InvalidToken` when the token is unknown, revoked,
    /// or expired. The revoke-and-insert happens as one atomic store
    /// operation; of two racing rotations on the same value exactly
    /// one succeeds.
    pub async fn rotate(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<(RefreshToken, RefreshToken), AppError> {
        let existing = match self.store.find_by_token(token_value).await? {
            Some(token) => token,
            None => {
                tracing::warn!("Unknown refresh token presented for rotation");
                return Err(AuthError::InvalidToken.into());
            }
        };

        if existing.revoked {
            // A consumed token presented a second time is the replay
            // signature of token theft.
            tracing::warn!(
                user_id = %existing.user_id,
                token_id = %existing.id,
                "Revoked refresh token presented again; possible token reuse"
            );
            return Err(AuthError::InvalidToken.into());
        }
        if !existing.is_active(now) {
            tracing::info!(
                user_id = %existing.user_id,
                token_id = %existing.id,
                "Expired refresh token presented for rotation"
            );
            return Err(AuthError::InvalidToken.into());
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let replacement = self.new_record(existing.user_id, now);
            match self.store.rotate(token_value, now, &replacement).await {
                Ok(Some(revoked)) => {
                    tracing::info!(
                        user_id = %revoked.user_id,
                        old_token_id = %revoked.id,
                        new_token_id = %replacement.id,
                        "Refresh token rotated"
                    );
                    return Ok((revoked, replacement));
                }
                Ok(None) => {
                    // Lost a race: another rotation consumed it first.
                    tracing::warn!(
                        user_id = %existing.user_id,
                        token_id = %existing.id,
                        "Refresh token consumed concurrently; rejecting as reuse"
                    );
                    return Err(AuthError::InvalidToken.into());
                }
                Err(StoreError::UniqueViolation(msg)) => {
                    tracing::warn!(
                        user_id = %existing.user_id,
                        attempt = attempts,
                        "Replacement token value collision, regenerating"
                    );
                    if attempts >= MAX_GENERATE_ATTEMPTS {
                        return Err(StoreError::UniqueViolation(msg).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Mark a token revoked. Returns whether a live token was changed;
    /// idempotent, and revoking an already-expired token is a no-op
    /// that still reports the change.
    pub async fn revoke(&self, token_value: &str) -> Result<bool, AppError> {
        let changed = self.store.revoke(token_value).await?;
        if changed {
            tracing::info!("Refresh token revoked");
        }
        Ok(changed)
    }
}
