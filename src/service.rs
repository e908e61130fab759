/// Credential Service: the four public operations.
///
/// Register, login, refresh, and revoke compose the Identity Provider,
/// the Access Token Issuer, and the Refresh Token Manager. Failures of
/// the credential checks collapse to `InvalidCredentials` so callers
/// cannot probe which check failed.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::{AccessTokenIssuer, IssuedAccessToken, RefreshToken, RefreshTokenManager};
use crate::error::{AppError, AuthError};
use crate::identity::{IdentityProvider, User};
use crate::validators::{is_valid_email, is_valid_name, validate_password_strength};

/// Role granted to every newly registered principal.
pub const DEFAULT_ROLE: &str = "User";

#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Public principal info returned alongside a token pair.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<String>,
}

/// A successful authentication: signed access token, opaque refresh
/// token, and the principal's public info.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: IssuedAccessToken,
    pub refresh_token: RefreshToken,
    pub user: UserInfo,
}

#[derive(Clone)]
pub struct CredentialService {
    identity: Arc<dyn IdentityProvider>,
    issuer: AccessTokenIssuer,
    refresh_tokens: RefreshTokenManager,
}

impl CredentialService {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        issuer: AccessTokenIssuer,
        refresh_tokens: RefreshTokenManager,
    ) -> Self {
        Self {
            identity,
            issuer,
            refresh_tokens,
        }
    }

    /// Create a principal and issue its first token pair. Fails with
    /// `DuplicateIdentity` when the email is already registered.
    pub async fn register(&self, input: &RegisterInput) -> Result<AuthSession, AppError> {
        let email = is_valid_email(&input.email)?;
        let first_name = is_valid_name("first_name", &input.first_name)?;
        let last_name = is_valid_name("last_name", &input.last_name)?;
        validate_password_strength(&input.password)?;

        if self.identity.find_by_email(&email).await?.is_some() {
            return Err(AuthError::DuplicateIdentity.into());
        }

        let user = self
            .identity
            .create(&email, &input.password, &first_name, &last_name)
            .await?;
        self.identity.assign_role(user.id, DEFAULT_ROLE).await?;

        tracing::info!(user_id = %user.id, "User registered");

        let now = Utc::now();
        let refresh_token = self.refresh_tokens.generate(user.id, now).await?;
        self.session(user, refresh_token, now).await
    }

    /// Authenticate with email and password. Unknown email and wrong
    /// password are indistinguishable to the caller. Each login opens
    /// an independent refresh chain.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AppError> {
        let email = is_valid_email(email)?;

        let user = match self.identity.find_by_email(&email).await? {
            Some(user) => user,
            None => {
                tracing::warn!("Login attempt for unknown email");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        if !self.identity.verify_password(user.id, password).await? {
            tracing::warn!(user_id = %user.id, "Login attempt with wrong password");
            return Err(AuthError::InvalidCredentials.into());
        }

        tracing::info!(user_id = %user.id, "User logged in");

        let now = Utc::now();
        let refresh_token = self.refresh_tokens.generate(user.id, now).await?;
        self.session(user, refresh_token, now).await
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// consumed; roles and claims are re-fetched so changes since the
    /// last issuance are reflected in the new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AppError> {
        let now = Utc::now();

        let (_, replacement) = self
            .refresh_tokens
            .rotate(refresh_token, now)
            .await
            .map_err(|e| match e {
                AppError::Auth(_) => AppError::Auth(AuthError::InvalidCredentials),
                other => other,
            })?;

        let user = self
            .identity
            .find_by_id(replacement.user_id)
            .await?
            .ok_or_else(|| {
                tracing::warn!(
                    user_id = %replacement.user_id,
                    "Refresh token owner no longer exists"
                );
                AppError::Auth(AuthError::InvalidCredentials)
            })?;

        self.session(user, replacement, now).await
    }

    /// Invalidate a refresh token. Returns whether a live token was
    /// found and revoked.
    pub async fn revoke(&self, refresh_token: &str) -> Result<bool, AppError> {
        self.refresh_tokens.revoke(refresh_token).await
    }

    async fn session(
        &self,
        user: User,
        refresh_token: RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<AuthSession, AppError> {
        let roles = self.identity.roles(user.id).await?;
        let extra: BTreeMap<String, String> = self
            .identity
            .claims(user.id)
            .await?
            .into_iter()
            .map(|(key, value)| (key.as_str().to_owned(), value))
            .collect();

        let access_token = self.issuer.issue(&user, &roles, &extra, now)?;

        Ok(AuthSession {
            access_token,
            refresh_token,
            user: UserInfo {
                id: user.id.to_string(),
                email: user.email,
                first_name: user.first_name,
                last_name: user.last_name,
                roles,
            },
        })
    }
}
