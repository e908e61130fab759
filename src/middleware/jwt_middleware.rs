/// Request-authenticating middleware.
///
/// Verifies the bearer access token on protected routes and injects
/// the decoded claims into request extensions. Verification is pure
/// (signature + embedded window), so no storage is touched per
/// request.
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, HttpResponse,
};
use chrono::Utc;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::AccessTokenIssuer;
use crate::error::VerifyError;

pub struct JwtMiddleware {
    issuer: AccessTokenIssuer,
}

impl JwtMiddleware {
    pub fn new(issuer: AccessTokenIssuer) -> Self {
        Self { issuer }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(JwtMiddlewareService {
            service: Rc::new(service),
            issuer: self.issuer.clone(),
        }))
    }
}

pub struct JwtMiddlewareService<S> {
    service: Rc<S>,
    issuer: AccessTokenIssuer,
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let bearer = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_owned);

        let token = match bearer {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::warn!("Missing or malformed Authorization header");
                let response = HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "Missing or invalid authorization header",
                    "code": "UNAUTHORIZED"
                }));
                return Box::pin(async move {
                    Err(actix_web::error::InternalError::from_response("Unauthorized", response)
                        .into())
                });
            }
        };

        match self.issuer.verify(&token, Utc::now()) {
            Ok(claims) => {
                tracing::debug!(
                    user_id = %claims.sub,
                    email = %claims.email,
                    "Access token verified"
                );
                req.extensions_mut().insert(claims);

                let service = self.service.clone();
                Box::pin(async move { service.call(req).await })
            }
            Err(e) => {
                // Distinguish kinds in the log only; the response body
                // stays uniform.
                match e {
                    VerifyError::Expired => {
                        tracing::warn!("Access token outside validity window")
                    }
                    VerifyError::AudienceMismatch => {
                        tracing::warn!("Access token issuer/audience mismatch")
                    }
                    VerifyError::InvalidSignature => {
                        tracing::warn!("Access token signature rejected")
                    }
                }
                let response = HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "Invalid or expired token",
                    "code": "TOKEN_INVALID"
                }));
                Box::pin(async move {
                    Err(actix_web::error::InternalError::from_response("Invalid token", response)
                        .into())
                })
            }
        }
    }
}
