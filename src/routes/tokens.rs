use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::AppError;
use crate::purpose_token::TokenUsage;
use crate::session_manager::AuthSessionManager;

#[derive(Deserialize)]
pub struct RequestTokenRequest {
    pub usage: TokenUsage,
}

#[derive(Deserialize)]
pub struct VerifyTokenRequest {
    pub token: String,
    pub usage: TokenUsage,
}

#[derive(Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub usage: TokenUsage,
    pub expired_at: String,
}

/// POST /api/tokens
///
/// Issue a purpose token owned by the caller.
pub async fn request_token(
    caller: Caller,
    form: web::Json<RequestTokenRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let token = manager.tokens().request(caller.user_id, form.usage).await?;

    Ok(HttpResponse::Created().json(IssuedToken {
        token: token.token().to_string(),
        usage: token.usage(),
        expired_at: token.expired_at().to_rfc3339(),
    }))
}

/// POST /tokens/verify
///
/// Consumes the token and returns its owner.
pub async fn verify_token(
    form: web::Json<VerifyTokenRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let user_id: Uuid = manager.tokens().verify(&form.token, form.usage).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user_id": user_id })))
}

/// POST /api/tokens/auth-verify
///
/// Consumes the token, which must belong to the caller.
pub async fn auth_verify_token(
    caller: Caller,
    form: web::Json<VerifyTokenRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    manager
        .tokens()
        .auth_verify(&form.token, form.usage, caller.user_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
