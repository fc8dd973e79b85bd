use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use sqlx::PgPool;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenIssuer;
use crate::clients::{HttpMailClient, HttpRoleClient, PgUserRepository};
use crate::configuration::Settings;
use crate::error::ConfigError;
use crate::middleware::{JwtMiddleware, RequestLogger};
use crate::purpose_token::PurposeTokenService;
use crate::routes::{
    auth_verify_token, delete_account, forgot_password, get_credentials, health_check, login,
    logout, logout_all, refresh, register, request_token, reset_password, verify_email,
    verify_token,
};
use crate::session_manager::AuthSessionManager;
use crate::store::{PurposeTokenStore, SessionStore};

/// Wire the manager from configuration and the chosen stores.
pub fn build_session_manager(
    configuration: &Settings,
    sessions: Arc<dyn SessionStore>,
    purpose_tokens: Arc<dyn PurposeTokenStore>,
    pool: PgPool,
) -> Result<AuthSessionManager, ConfigError> {
    let issuer = TokenIssuer::from_settings(&configuration.jwt)?;
    let tokens = PurposeTokenService::new(purpose_tokens, configuration.purpose_token.clone());
    let roles = HttpRoleClient::new(&configuration.role_service, &configuration.circuit_breaker);
    let mail = HttpMailClient::new(&configuration.email_client, &configuration.circuit_breaker)?;

    Ok(AuthSessionManager::new(
        sessions,
        tokens,
        Arc::new(PgUserRepository::new(pool)),
        Arc::new(roles),
        Arc::new(mail),
        issuer,
    ))
}

/// Delete expired sessions and purpose tokens on a fixed period. Reads
/// already ignore them; this only bounds storage.
pub fn spawn_expiry_sweeper(
    sessions: Arc<dyn SessionStore>,
    purpose_tokens: Arc<dyn PurposeTokenStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match sessions.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged = purged, "Expired sessions purged"),
                Err(e) => tracing::error!(error = %e, "Session expiry sweep failed"),
            }
            match purpose_tokens.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged = purged, "Expired purpose tokens purged"),
                Err(e) => tracing::error!(error = %e, "Purpose token expiry sweep failed"),
            }
        }
    })
}

pub fn run(listener: TcpListener, manager: AuthSessionManager) -> Result<Server, std::io::Error> {
    let issuer = manager.issuer().clone();
    let manager = web::Data::new(manager);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(RequestLogger)
            .app_data(manager.clone())
            // Public routes
            .route("/health_check", web::get().to(health_check))
            .route("/auth/register", web::post().to(register))
            .route("/auth/login", web::post().to(login))
            .route("/auth/refresh", web::post().to(refresh))
            .route("/auth/verify-email", web::post().to(verify_email))
            .route("/auth/forgot-password", web::post().to(forgot_password))
            .route("/auth/reset-password", web::post().to(reset_password))
            .route("/tokens/verify", web::post().to(verify_token))
            // Protected routes
            .service(
                web::scope("/api")
                    .wrap(JwtMiddleware::new(issuer.clone()))
                    .route("/users/{id}/credentials", web::get().to(get_credentials))
                    .route("/users/{id}/logout", web::post().to(logout))
                    .route("/users/{id}/logout-all", web::post().to(logout_all))
                    .route("/users/{id}", web::delete().to(delete_account))
                    .route("/tokens", web::post().to(request_token))
                    .route("/tokens/auth-verify", web::post().to(auth_verify_token)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
