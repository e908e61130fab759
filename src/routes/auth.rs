/// HTTP adapters over the credential service.
///
/// Thin handlers: deserialize, delegate, serialize. All policy lives
/// in the service and below.
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::AccessClaims;
use crate::error::AppError;
use crate::service::{AuthSession, CredentialService, RegisterInput, UserInfo};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Carries exactly one field: the refresh token string.
#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: String,
    pub user: UserInfo,
}

impl From<AuthSession> for AuthResponse {
    fn from(session: AuthSession) -> Self {
        Self {
            token: session.access_token.token,
            refresh_token: session.refresh_token.token,
            expires_at: session.access_token.expires_at.to_rfc3339(),
            user: session.user,
        }
    }
}

#[derive(Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

/// POST /auth/register
pub async fn register(
    form: web::Json<RegisterRequest>,
    service: web::Data<CredentialService>,
) -> Result<HttpResponse, AppError> {
    let input = RegisterInput {
        email: form.email.clone(),
        password: form.password.clone(),
        first_name: form.first_name.clone(),
        last_name: form.last_name.clone(),
    };

    let session = service.register(&input).await?;
    Ok(HttpResponse::Created().json(AuthResponse::from(session)))
}

/// POST /auth/login
pub async fn login(
    form: web::Json<LoginRequest>,
    service: web::Data<CredentialService>,
) -> Result<HttpResponse, AppError> {
    let session = service.login(&form.email, &form.password).await?;
    Ok(HttpResponse::Ok().json(AuthResponse::from(session)))
}

/// POST /auth/refresh
///
/// Exchanges a refresh token for a new pair; the presented token is
/// consumed. Any failure surfaces as a generic credential error.
pub async fn refresh(
    form: web::Json<RefreshRequest>,
    service: web::Data<CredentialService>,
) -> Result<HttpResponse, AppError> {
    let session = service.refresh(&form.refresh_token).await?;
    Ok(HttpResponse::Ok().json(AuthResponse::from(session)))
}

/// POST /auth/revoke
///
/// Responds with whether a live token was found and invalidated.
pub async fn revoke(
    form: web::Json<RefreshRequest>,
    service: web::Data<CredentialService>,
) -> Result<HttpResponse, AppError> {
    let revoked = service.revoke(&form.refresh_token).await?;
    Ok(HttpResponse::Ok().json(RevokeResponse { revoked }))
}

/// GET /auth/me
///
/// Claims are injected by the JWT middleware; the response is built
/// from the token alone, with no storage lookup.
pub async fn get_current_user(claims: web::ReqData<AccessClaims>) -> Result<HttpResponse, AppError> {
    let claims = claims.into_inner();
    let user_id = claims.user_id()?;

    Ok(HttpResponse::Ok().json(UserInfo {
        id: user_id.to_string(),
        email: claims.email,
        first_name: claims.first_name,
        last_name: claims.last_name,
        roles: claims.roles,
    }))
}
