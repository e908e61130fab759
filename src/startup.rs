use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use sqlx::PgPool;
use std::net::TcpListener;
use std::sync::Arc;

use crate::auth::{AccessTokenIssuer, PgTokenStore, RefreshTokenManager};
use crate::configuration::AuthSettings;
use crate::error::AppError;
use crate::identity::PgIdentityProvider;
use crate::middleware::JwtMiddleware;
use crate::routes::{get_current_user, health_check, login, refresh, register, revoke};
use crate::service::CredentialService;

/// Wire the collaborators and start the server.
///
/// An empty signing key is refused here, before any request is served.
pub fn run(
    listener: TcpListener,
    connection: PgPool,
    auth_settings: AuthSettings,
) -> Result<Server, AppError> {
    let issuer = AccessTokenIssuer::new(&auth_settings)?;
    let identity = Arc::new(PgIdentityProvider::new(connection.clone()));
    let token_store = Arc::new(PgTokenStore::new(connection));
    let refresh_tokens =
        RefreshTokenManager::new(token_store, auth_settings.refresh_token_lifetime());
    let service = web::Data::new(CredentialService::new(identity, issuer.clone(), refresh_tokens));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            // Public routes
            .route("/health_check", web::get().to(health_check))
            .route("/auth/register", web::post().to(register))
            .route("/auth/login", web::post().to(login))
            .route("/auth/refresh", web::post().to(refresh))
            .route("/auth/revoke", web::post().to(revoke))
            // Protected routes
            .service(
                web::scope("/auth")
                    .wrap(JwtMiddleware::new(issuer.clone()))
                    .route("/me", web::get().to(get_current_user)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
