/// Identity Provider: principal storage, password verification, and
/// role/claim lookup.
///
/// The credential service treats principals as read-only input; this
/// module owns user rows, bcrypt hashes, and the role/claim tables.
use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::ClaimKey;
use crate::error::{AppError, AuthError, StoreError};

/// Public principal data. Password material never leaves the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError>;

    /// Create a principal. Fails with `DuplicateIdentity` when the
    /// email is already taken, including when a concurrent
    /// registration wins the race.
    async fn create(
        &self,
        email: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<User, AppError>;

    /// Check a plaintext password against the stored hash. An unknown
    /// principal verifies as false, not as an error.
    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError>;

    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>, AppError>;

    /// Permission claims derived from the principal's roles, ordered
    /// by key.
    async fn claims(&self, user_id: Uuid) -> Result<Vec<(ClaimKey, String)>, AppError>;

    async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<(), AppError>;
}

pub(crate) fn hash_password(password: &str) -> Result<String, AppError> {
    hash(password, DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))
}

pub(crate) fn check_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    verify(password, password_hash)
        .map_err(|e| AppError::Internal(format!("password verification failed: {}", e)))
}

#[derive(Clone)]
pub struct PgIdentityProvider {
    pool: PgPool,
}

impl PgIdentityProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type UserRow = (Uuid, String, String, String);

fn user_from_row(row: UserRow) -> User {
    User {
        id: row.0,
        email: row.1,
        first_name: row.2,
        last_name: row.3,
    }
}

#[async_trait]
impl IdentityProvider for PgIdentityProvider {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, first_name, last_name FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(user_from_row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, first_name, last_name FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(user_from_row))
    }

    async fn create(
        &self,
        email: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<User, AppError> {
        let password_hash = hash_password(password)?;
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO users (id, email, first_name, last_name, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(user),
            Err(e) => match StoreError::from(e) {
                StoreError::UniqueViolation(_) => Err(AuthError::DuplicateIdentity.into()),
                other => Err(other.into()),
            },
        }
    }

    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError> {
        let stored = sqlx::query_as::<_, (String,)>(
            "SELECT password_hash FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match stored {
            Some((password_hash,)) => check_password(password, &password_hash),
            None => Ok(false),
        }
    }

    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT r.name
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn claims(&self, user_id: Uuid) -> Result<Vec<(ClaimKey, String)>, AppError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT rc.claim_key, rc.claim_value
            FROM role_claims rc
            JOIN user_roles ur ON ur.role_id = rc.role_id
            WHERE ur.user_id = $1
            ORDER BY rc.claim_key
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| (ClaimKey::from(key.as_str()), value))
            .collect())
    }

    async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = $2
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the role does not exist or the membership was
            // already present; only the former is a real problem.
            let known = sqlx::query_as::<_, (Uuid,)>("SELECT id FROM roles WHERE name = $1")
                .bind(role)
                .fetch_optional(&self.pool)
                .await?;
            if known.is_none() {
                return Err(AppError::Internal(format!("unknown role: {}", role)));
            }
        }

        Ok(())
    }
}

/// Roles and per-role permission claims provisioned at startup.
/// Idempotent; re-running against a seeded database changes nothing.
pub async fn seed_roles(pool: &PgPool) -> Result<(), AppError> {
    let role_claims: [(&str, &[ClaimKey]); 3] = [
        (
            "SuperAdmin",
            &[
                ClaimKey::UsersCreate,
                ClaimKey::UsersUpdate,
                ClaimKey::UsersDelete,
                ClaimKey::RecordsRead,
                ClaimKey::RecordsCreate,
                ClaimKey::RecordsUpdate,
                ClaimKey::RecordsDelete,
            ],
        ),
        (
            "Admin",
            &[
                ClaimKey::UsersCreate,
                ClaimKey::UsersUpdate,
                ClaimKey::RecordsRead,
                ClaimKey::RecordsCreate,
                ClaimKey::RecordsUpdate,
                ClaimKey::RecordsDelete,
            ],
        ),
        ("User", &[ClaimKey::RecordsRead]),
    ];

    for (role, claims) in role_claims {
        sqlx::query(
            r#"
            INSERT INTO roles (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(role)
        .execute(pool)
        .await?;

        for claim in claims {
            sqlx::query(
                r#"
                INSERT INTO role_claims (role_id, claim_key, claim_value)
                SELECT id, $2, 'true' FROM roles WHERE name = $1
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role)
            .bind(claim.as_str())
            .execute(pool)
            .await?;
        }
    }

    tracing::info!("Role and claim seed data ensured");
    Ok(())
}
