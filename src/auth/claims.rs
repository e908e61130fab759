/// Access-token claims.
///
/// The payload of a signed access token: registered claims (RFC 7519)
/// plus the principal's identity, role memberships, and any extra
/// permission claims attached at issuance time.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Claims embedded in every access token.
///
/// Extra permission claims ride in the flattened map so they appear as
/// top-level JWT claims on the wire.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccessClaims {
    /// Subject (principal id as UUID string)
    pub sub: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// One entry per role membership
    #[serde(default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub aud: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Not valid before (Unix timestamp)
    pub nbf: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl AccessClaims {
    /// Extract the principal id from `sub`.
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::Internal("invalid principal id in token".to_string()))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Well-known permission claim keys, with an escape hatch for custom
/// ones. The enumerated set mirrors the permissions the record-keeping
/// application checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimKey {
    UsersCreate,
    UsersUpdate,
    UsersDelete,
    RecordsRead,
    RecordsCreate,
    RecordsUpdate,
    RecordsDelete,
    Custom(String),
}

impl ClaimKey {
    pub fn as_str(&self) -> &str {
        match self {
            ClaimKey::UsersCreate => "users:create",
            ClaimKey::UsersUpdate => "users:update",
            ClaimKey::UsersDelete => "users:delete",
            ClaimKey::RecordsRead => "records:read",
            ClaimKey::RecordsCreate => "records:create",
            ClaimKey::RecordsUpdate => "records:update",
            ClaimKey::RecordsDelete => "records:delete",
            ClaimKey::Custom(key) => key.as_str(),
        }
    }
}

impl From<&str> for ClaimKey {
    fn from(key: &str) -> Self {
        match key {
            "users:create" => ClaimKey::UsersCreate,
            "users:update" => ClaimKey::UsersUpdate,
            "users:delete" => ClaimKey::UsersDelete,
            "records:read" => ClaimKey::RecordsRead,
            "records:create" => ClaimKey::RecordsCreate,
            "records:update" => ClaimKey::RecordsUpdate,
            "records:delete" => ClaimKey::RecordsDelete,
            other => ClaimKey::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
