/// Token Store: the persistence boundary for refresh tokens.
///
/// The refresh-token manager is the only caller. Rotation is a single
/// atomic store operation, never a revoke followed by a separate
/// insert, so a crash or cancellation mid-rotation cannot strand a
/// revoked token without its replacement.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

/// A stored refresh token. Rows are created by `insert`/`rotate`,
/// mutated only by flipping `revoked`, and never deleted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshToken {
    /// Not revoked and not past expiry. Expiry is computed at read
    /// time; there is no stored `Expired` state.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a new token. A value collision surfaces as
    /// `StoreError::UniqueViolation`; callers regenerate rather than
    /// ignore it.
    async fn insert(&self, token: &RefreshToken) -> Result<(), StoreError>;

    /// Exact match on the token value. Pure read; active-state checks
    /// are the caller's job.
    async fn find_by_token(&self, token_value: &str) -> Result<Option<RefreshToken>, StoreError>;

    /// Atomically revoke `old_token_value` and persist `replacement`.
    ///
    /// The revocation is conditional on the old token still being
    /// active at `now`; when the condition fails (already consumed,
    /// revoked, expired, or unknown) nothing is written and `None` is
    /// returned. Two racing rotations of the same token therefore
    /// yield exactly one `Some`.
    async fn rotate(
        &self,
        old_token_value: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<Option<RefreshToken>, StoreError>;

    /// Mark a token revoked. Returns whether a live (not yet revoked)
    /// token was changed; idempotent, and indifferent to expiry.
    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError>;
}

type RefreshTokenRow = (Uuid, Uuid, String, DateTime<Utc>, DateTime<Utc>, bool);

fn from_row(row: RefreshTokenRow) -> RefreshToken {
    RefreshToken {
        id: row.0,
        user_id: row.1,
        token: row.2,
        created_at: row.3,
        expires_at: row.4,
        revoked: row.5,
    }
}

/// Postgres-backed token store. Rotation runs in one transaction whose
/// conditional `UPDATE` serializes racing rotations on the same row.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token, created_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.revoked)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn find_by_token(&self, token_value: &str) -> Result<Option<RefreshToken>, StoreError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT id, user_id, token, created_at, expires_at, revoked
            FROM refresh_tokens
            WHERE token = $1
            "#,
        )
        .bind(token_value)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(row.map(from_row))
    }

    async fn rotate(
        &self,
        old_token_value: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<Option<RefreshToken>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let revoked = sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE token = $1 AND revoked = FALSE AND expires_at > $2
            RETURNING id, user_id, token, created_at, expires_at, revoked
            "#,
        )
        .bind(old_token_value)
        .bind(now)
        .fetch_optional(&mut tx)
        .await
        .map_err(StoreError::from)?;

        let revoked = match revoked {
            Some(row) => from_row(row),
            // Condition failed; the transaction is dropped unwritten.
            None => return Ok(None),
        };

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token, created_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(replacement.id)
        .bind(replacement.user_id)
        .bind(&replacement.token)
        .bind(replacement.created_at)
        .bind(replacement.expires_at)
        .bind(replacement.revoked)
        .execute(&mut tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;

        Ok(Some(revoked))
    }

    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE token = $1 AND revoked = FALSE
            "#,
        )
        .bind(token_value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(result.rows_affected() > 0)
    }
}

/// In-memory token store. Used by unit tests and local development;
/// the mutex gives the same per-token serialization the conditional
/// update gives in Postgres.
#[derive(Default)]
pub struct InMemoryTokenStore {
    inner: std::sync::Mutex<std::collections::HashMap<String, RefreshToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, std::collections::HashMap<String, RefreshToken>>, StoreError>
    {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unexpected("token store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), StoreError> {
        let mut tokens = self.lock()?;
        if tokens.contains_key(&token.token) {
            return Err(StoreError::UniqueViolation("refresh token value".to_string()));
        }
        tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn find_by_token(&self, token_value: &str) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.lock()?.get(token_value).cloned())
    }

    async fn rotate(
        &self,
        old_token_value: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<Option<RefreshToken>, StoreError> {
        let mut tokens = self.lock()?;

        if tokens.contains_key(&replacement.token) {
            return Err(StoreError::UniqueViolation("refresh token value".to_string()));
        }

        let revoked = match tokens.get_mut(old_token_value) {
            Some(old) if old.is_active(now) => {
                old.revoked = true;
                old.clone()
            }
            _ => return Ok(None),
        };

        tokens.insert(replacement.token.clone(), replacement.clone());
        Ok(Some(revoked))
    }

    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError> {
        let mut tokens = self.lock()?;
        match tokens.get_mut(token_value) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
