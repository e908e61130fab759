/// Access token issuance and verification.
///
/// Stateless: holds only key material derived from configuration.
/// Verification never touches storage or the network, so it is safe to
/// run on every inbound request.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::auth::claims::AccessClaims;
use crate::configuration::AuthSettings;
use crate::error::{AppError, ConfigError, VerifyError};
use crate::identity::User;

/// A freshly signed access token together with its expiry, which the
/// wire contract exposes alongside the token itself.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccessTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_token_lifetime: chrono::Duration,
}

impl AccessTokenIssuer {
    /// Fails with `MisconfiguredSigningKey` when the secret is empty.
    /// This is a fatal startup condition, not a per-request error.
    pub fn new(settings: &AuthSettings) -> Result<Self, ConfigError> {
        if settings.key.trim().is_empty() {
            return Err(ConfigError::MisconfiguredSigningKey);
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(settings.key.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.key.as_bytes()),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            access_token_lifetime: settings.access_token_lifetime(),
        })
    }

    /// Build and sign an access token for `user`, valid in
    /// `[now, now + access lifetime]`. Deterministic for identical
    /// inputs and timestamp.
    pub fn issue(
        &self,
        user: &User,
        roles: &[String],
        extra_claims: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<IssuedAccessToken, AppError> {
        let expires_at = now + self.access_token_lifetime;
        let claims = AccessClaims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            roles: roles.to_vec(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: expires_at.timestamp(),
            nbf: now.timestamp(),
            iat: now.timestamp(),
            extra: extra_claims.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("token generation failed: {}", e)))?;

        Ok(IssuedAccessToken { token, expires_at })
    }

    /// Verify signature, issuer, and audience, then check the validity
    /// window against the caller-supplied instant. Pure: the outcome
    /// depends only on `(token, now)` and the configured key material.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        // The window is checked below against `now`, not the wall clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidIssuer
                | jsonwebtoken::errors::ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
                _ => VerifyError::InvalidSignature,
            },
        )?;

        let ts = now.timestamp();
        if ts < data.claims.nbf || ts > data.claims.exp {
            return Err(VerifyError::Expired);
        }

        Ok(data.claims)
    }
}
